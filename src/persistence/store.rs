use crate::entities::item::{ItemKind, ItemStack};
use crate::world::position::Position;
use crate::world::spawner::{Spawner, SpawnerContext, SpawnerId, SpawnerKind, SpawnerSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} failed for {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spawner record {} is invalid: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("spawner record encode failed for {id}: {source}")]
    Encode {
        id: SpawnerId,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("spawner record id mismatch: expected {expected}, got {found}")]
    IdMismatch { expected: SpawnerId, found: SpawnerId },
}

fn default_stack_size() -> u32 {
    1
}

/// Persisted form of one spawner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnerRecord {
    pub id: SpawnerId,
    pub position: Position,
    pub kind: SpawnerKind,
    #[serde(default)]
    pub settings: SpawnerSettings,
    #[serde(default = "default_stack_size")]
    pub stack_size: u32,
    #[serde(default)]
    pub experience: u64,
    #[serde(default)]
    pub last_spawn_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<ItemKind>,
    #[serde(default)]
    pub items: Vec<ItemStack>,
}

/// One YAML file per spawner under `<root>/spawners`, with the previous
/// version kept as `<id>.yml.bak`.
#[derive(Debug, Clone)]
pub struct SpawnerStore {
    root: PathBuf,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<SpawnerRecord>,
    pub files: usize,
    pub errors: Vec<String>,
}

impl SpawnerStore {
    pub fn from_root(root: &Path) -> Self {
        Self {
            root: root.join("spawners"),
        }
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn load(&self, id: SpawnerId) -> Result<Option<SpawnerRecord>, StoreError> {
        let path = self.record_path(id);
        let backup_path = self.backup_path(id);
        let record = match read_record(&path) {
            Ok(Some(record)) => record,
            Ok(None) => return self.load_backup(id, &backup_path),
            Err(err) => match self.load_backup(id, &backup_path)? {
                Some(fallback) => {
                    log::warn!("spawner record {} unreadable, using backup: {}", id, err);
                    return Ok(Some(fallback));
                }
                None => return Err(err),
            },
        };
        check_id(id, &record)?;
        Ok(Some(record))
    }

    /// Loads and rebuilds the aggregate for `id`.
    pub fn load_spawner(
        &self,
        id: SpawnerId,
        ctx: &Arc<SpawnerContext>,
    ) -> Result<Option<Spawner>, StoreError> {
        Ok(self
            .load(id)?
            .map(|record| Spawner::from_record(record, Arc::clone(ctx))))
    }

    pub fn save(&self, record: &SpawnerRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            action: "spawner dir create",
            path: self.root.clone(),
            source,
        })?;
        let path = self.record_path(record.id);
        let backup_path = self.backup_path(record.id);
        let data = serde_yaml::to_string(record).map_err(|source| StoreError::Encode {
            id: record.id,
            source,
        })?;
        if path.exists() {
            fs::copy(&path, &backup_path).map_err(|source| StoreError::Io {
                action: "spawner backup",
                path: backup_path.clone(),
                source,
            })?;
        }
        fs::write(&path, data).map_err(|source| StoreError::Io {
            action: "spawner write",
            path,
            source,
        })
    }

    pub fn delete(&self, id: SpawnerId) -> Result<(), StoreError> {
        for path in [self.record_path(id), self.backup_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StoreError::Io {
                        action: "spawner delete",
                        path,
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Every record on disk. Broken files are reported, not fatal.
    pub fn load_all(&self) -> LoadReport {
        let mut report = LoadReport::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return report,
            Err(err) => {
                report.errors.push(format!(
                    "spawner dir read failed for {}: {}",
                    self.root.display(),
                    err
                ));
                return report;
            }
        };
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("yml") {
                continue;
            }
            report.files += 1;
            match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                Some(id) => ids.push(SpawnerId(id)),
                None => report
                    .errors
                    .push(format!("unexpected file in spawner dir: {}", path.display())),
            }
        }
        ids.sort();
        for id in ids {
            match self.load(id) {
                Ok(Some(record)) => report.records.push(record),
                Ok(None) => {}
                Err(err) => report.errors.push(err.to_string()),
            }
        }
        report
    }

    fn record_path(&self, id: SpawnerId) -> PathBuf {
        self.root.join(format!("{}.yml", id.0))
    }

    fn backup_path(&self, id: SpawnerId) -> PathBuf {
        self.root.join(format!("{}.yml.bak", id.0))
    }

    fn load_backup(
        &self,
        id: SpawnerId,
        backup_path: &Path,
    ) -> Result<Option<SpawnerRecord>, StoreError> {
        let Some(record) = read_record(backup_path)? else {
            return Ok(None);
        };
        check_id(id, &record)?;
        Ok(Some(record))
    }
}

fn read_record(path: &Path) -> Result<Option<SpawnerRecord>, StoreError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                action: "spawner read",
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_yaml::from_str(&data)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn check_id(expected: SpawnerId, record: &SpawnerRecord) -> Result<(), StoreError> {
    if record.id != expected {
        return Err(StoreError::IdMismatch {
            expected,
            found: record.id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::item::{ItemSignature, QualityFingerprint};
    use crate::world::position::WorldId;
    use crate::world::spawner::EntityType;
    use std::collections::BTreeMap;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "spawnstack_store_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn record(id: u64) -> SpawnerRecord {
        let mut enchantments = BTreeMap::new();
        enchantments.insert("power".to_string(), 2);
        SpawnerRecord {
            id: SpawnerId(id),
            position: Position::new(WorldId(1), 10, 64, -4),
            kind: SpawnerKind::Entity(EntityType::new("skeleton")),
            settings: SpawnerSettings::default(),
            stack_size: 3,
            experience: 42,
            last_spawn_ms: 1_000,
            sort: Some(ItemKind::new("bow")),
            items: vec![
                ItemStack::new(ItemSignature::new(ItemKind::new("bone"), 64), 130),
                ItemStack::new(
                    ItemSignature::with_quality(
                        ItemKind::new("bow"),
                        1,
                        QualityFingerprint {
                            durability: Some(7),
                            enchantments,
                            variant: None,
                        },
                    ),
                    2,
                ),
            ],
        }
    }

    #[test]
    fn save_then_load_keeps_record() {
        let root = temp_root("roundtrip");
        let store = SpawnerStore::new(&root);
        let original = record(5);
        store.save(&original).expect("save");
        assert_eq!(store.load(SpawnerId(5)).expect("load"), Some(original));
        assert_eq!(store.load(SpawnerId(6)).expect("load"), None);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn corrupt_record_falls_back_to_backup() {
        let root = temp_root("backup");
        let store = SpawnerStore::new(&root);
        let first = record(7);
        store.save(&first).expect("save");
        let mut second = first.clone();
        second.experience = 99;
        store.save(&second).expect("save again");
        fs::write(root.join("7.yml"), "id: [not a number").expect("corrupt");

        assert_eq!(store.load(SpawnerId(7)).expect("load"), Some(first));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn load_all_reports_bad_files_and_delete_removes() {
        let root = temp_root("all");
        let store = SpawnerStore::new(&root);
        store.save(&record(1)).expect("save");
        store.save(&record(2)).expect("save");
        fs::write(root.join("notes.yml"), "hello").expect("write");

        let report = store.load_all();
        assert_eq!(report.files, 3);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.errors.len(), 1);

        store.delete(SpawnerId(1)).expect("delete");
        store.delete(SpawnerId(1)).expect("delete twice");
        assert_eq!(store.load_all().records.len(), 1);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn id_mismatch_is_rejected() {
        let root = temp_root("mismatch");
        let store = SpawnerStore::new(&root);
        store.save(&record(3)).expect("save");
        fs::rename(root.join("3.yml"), root.join("4.yml")).expect("rename");
        assert!(matches!(
            store.load(SpawnerId(4)),
            Err(StoreError::IdMismatch { .. })
        ));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn load_spawner_rebuilds_aggregate() {
        let root = temp_root("aggregate");
        let store = SpawnerStore::new(&root);
        store.save(&record(8)).expect("save");
        let ctx = crate::world::spawner::tests::test_context(Arc::new(
            crate::persistence::autosave::DirtyTracker::new(),
        ));

        let spawner = store
            .load_spawner(SpawnerId(8), &ctx)
            .expect("load")
            .expect("present");
        let view = spawner.view(0, 45, 1_000).expect("view");
        assert_eq!(view.stack_size, 3);
        assert_eq!(view.used_slots, 5);
        assert_eq!(view.max_slots, 135);
        assert_eq!(view.items[0].signature.kind().as_str(), "bow");
        assert_eq!(spawner.sell_value().expect("value"), 260.0);
        assert_eq!(spawner.to_record().expect("record"), record(8));
        assert!(store.load_spawner(SpawnerId(9), &ctx).expect("load").is_none());
        let _ = fs::remove_dir_all(&root);
    }
}
