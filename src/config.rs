use crate::world::spawner::SpawnerSettings;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TICK_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("usage: {0}")]
    Usage(String),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub root: PathBuf,
    /// Stop after this many simulation ticks; `None` runs until shutdown.
    pub ticks: Option<u64>,
    pub tick_length: Duration,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        if args.len() < 2 {
            return Err(ConfigError::Usage(
                "spawnstack <data-root> [ticks]".to_string(),
            ));
        }

        let root = Path::new(&args[1]).to_path_buf();
        let ticks = match args.get(2) {
            Some(value) => Some(value.trim().parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!("ticks must be a number, got {:?}", value))
            })?),
            None => None,
        };
        let tick_ms = std::env::var("SPAWNSTACK_TICK_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_TICK_MS);
        Ok(Self {
            root,
            ticks,
            tick_length: Duration::from_millis(tick_ms),
        })
    }
}

/// Server-wide knobs from `<root>/config.yml`. Every field has a default,
/// so a missing file or a partial one is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub check_interval_ms: u64,
    pub lock_timeout_ms: u64,
    pub pregeneration_threshold_ms: u64,
    pub flush_interval_secs: u64,
    pub lock_sweep_interval_secs: u64,
    pub page_size: usize,
    pub max_stack_size: u32,
    pub background_workers: usize,
    pub defaults: SpawnerSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 1_000,
            lock_timeout_ms: 50,
            pregeneration_threshold_ms: 2_000,
            flush_interval_secs: 30,
            lock_sweep_interval_secs: 300,
            page_size: 45,
            max_stack_size: 1_000,
            background_workers: 2,
            defaults: SpawnerSettings::default(),
        }
    }
}

impl ServerSettings {
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let settings: Self = read_yaml_or_default(&root.join("config.yml"))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".to_string()));
        }
        if self.max_stack_size == 0 {
            return Err(ConfigError::Invalid(
                "max_stack_size must be at least 1".to_string(),
            ));
        }
        if self.defaults.min_mobs > self.defaults.max_mobs {
            return Err(ConfigError::Invalid(format!(
                "defaults.min_mobs {} exceeds max_mobs {}",
                self.defaults.min_mobs, self.defaults.max_mobs
            )));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs.max(1))
    }
}

pub(crate) fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn read_yaml_or_default<T: DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, ConfigError> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_yaml(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn from_args_requires_root() {
        assert!(matches!(
            AppConfig::from_args(&args(&["spawnstack"])),
            Err(ConfigError::Usage(_))
        ));
        let config = AppConfig::from_args(&args(&["spawnstack", "data", "12"])).expect("config");
        assert_eq!(config.root, PathBuf::from("data"));
        assert_eq!(config.ticks, Some(12));
        assert!(AppConfig::from_args(&args(&["spawnstack", "data", "many"])).is_err());
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let settings: ServerSettings = serde_yaml::from_str(
            "check_interval_ms: 250\ndefaults:\n  max_slots: 90\n",
        )
        .expect("parse");
        assert_eq!(settings.check_interval_ms, 250);
        assert_eq!(settings.page_size, 45);
        assert_eq!(settings.defaults.max_slots, 90);
        assert_eq!(settings.defaults.delay_ms, 25_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let root = std::env::temp_dir().join(format!("spawnstack_cfg_{}", std::process::id()));
        let settings = ServerSettings::load(&root).expect("defaults");
        assert_eq!(settings, ServerSettings::default());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = ServerSettings {
            page_size: 0,
            ..ServerSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
