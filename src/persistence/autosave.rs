use crate::persistence::store::SpawnerStore;
use crate::world::registry::SpawnerRegistry;
use crate::world::spawner::{SpawnerError, SpawnerId};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Where spawners report that their persisted form is out of date.
pub trait ChangeTracker: Send + Sync {
    fn mark_modified(&self, id: SpawnerId);

    fn mark_deleted(&self, id: SpawnerId);
}

#[derive(Debug, Default)]
struct DirtySet {
    modified: BTreeSet<SpawnerId>,
    deleted: BTreeSet<SpawnerId>,
}

/// Ids taken for one flush, in id order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirtyBatch {
    pub modified: Vec<SpawnerId>,
    pub deleted: Vec<SpawnerId>,
}

impl DirtyBatch {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Collects dirty ids between flushes. A deletion cancels any pending
/// save of the same id.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    pending: Mutex<DirtySet>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> DirtyBatch {
        let mut pending = self.pending();
        DirtyBatch {
            modified: std::mem::take(&mut pending.modified).into_iter().collect(),
            deleted: std::mem::take(&mut pending.deleted).into_iter().collect(),
        }
    }

    /// Puts ids back after a flush could not write them.
    pub fn requeue_modified<I>(&self, ids: I)
    where
        I: IntoIterator<Item = SpawnerId>,
    {
        let mut pending = self.pending();
        for id in ids {
            if !pending.deleted.contains(&id) {
                pending.modified.insert(id);
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        let pending = self.pending();
        pending.modified.len() + pending.deleted.len()
    }

    fn pending(&self) -> MutexGuard<'_, DirtySet> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChangeTracker for DirtyTracker {
    fn mark_modified(&self, id: SpawnerId) {
        let mut pending = self.pending();
        if !pending.deleted.contains(&id) {
            pending.modified.insert(id);
        }
    }

    fn mark_deleted(&self, id: SpawnerId) {
        let mut pending = self.pending();
        pending.modified.remove(&id);
        pending.deleted.insert(id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub interval_seconds: u64,
}

impl AutosaveConfig {
    pub fn interval(self) -> Option<Duration> {
        if self.interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.interval_seconds.max(1)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutosaveState {
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl AutosaveState {
    pub fn new(config: AutosaveConfig, now: Instant) -> Self {
        let interval = config.interval();
        let next_due = interval.map(|interval| now + interval);
        Self { interval, next_due }
    }

    pub fn due(&self, now: Instant) -> bool {
        self.next_due.map_or(false, |next| now >= next)
    }

    pub fn mark_saved(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            self.next_due = Some(now + interval);
        }
    }
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub saved: usize,
    pub deleted: usize,
    /// Spawners whose locks were busy; they stay dirty for the next flush.
    pub deferred: usize,
    pub errors: Vec<String>,
}

/// Writes every dirty spawner and removes every deleted one. Never waits
/// longer than the spawners' own lock timeout per entry.
pub fn flush_dirty(
    tracker: &DirtyTracker,
    registry: &SpawnerRegistry,
    store: &SpawnerStore,
) -> FlushReport {
    let batch = tracker.take();
    let mut report = FlushReport::default();
    let mut retry = Vec::new();

    for id in batch.modified {
        let Some(spawner) = registry.get(id) else {
            continue;
        };
        match spawner.to_record() {
            Ok(record) => match store.save(&record) {
                Ok(()) => report.saved += 1,
                Err(err) => {
                    report.errors.push(err.to_string());
                    retry.push(id);
                }
            },
            Err(SpawnerError::Busy(_)) => {
                report.deferred += 1;
                retry.push(id);
            }
            Err(err) => report.errors.push(err.to_string()),
        }
    }

    for id in batch.deleted {
        match store.delete(id) {
            Ok(()) => report.deleted += 1,
            Err(err) => {
                report.errors.push(err.to_string());
                tracker.mark_deleted(id);
            }
        }
    }

    tracker.requeue_modified(retry);
    report
}
