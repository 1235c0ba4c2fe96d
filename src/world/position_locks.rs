use crate::world::position::Position;
use crate::world::timed_lock::TimedMutex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Locks striped by block position, serializing placement and removal
/// at one position without touching any other.
///
/// Entries are created on demand and reclaimed by [`PositionLockRegistry::sweep`].
/// There is no fairness: a caller that loses the race retries later.
#[derive(Debug, Default)]
pub struct PositionLockRegistry {
    locks: Mutex<HashMap<Position, Arc<TimedMutex<()>>>>,
}

/// Held position lock; released on drop.
#[derive(Debug)]
pub struct PositionGuard {
    position: Position,
    lock: Arc<TimedMutex<()>>,
}

impl PositionGuard {
    pub fn position(&self) -> Position {
        self.position
    }
}

impl Drop for PositionGuard {
    fn drop(&mut self) {
        self.lock.restore(());
    }
}

impl PositionLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `position`, created if absent.
    pub fn lock_for(&self, position: Position) -> Arc<TimedMutex<()>> {
        Arc::clone(
            self.locks()
                .entry(position)
                .or_insert_with(|| Arc::new(TimedMutex::new(()))),
        )
    }

    pub fn try_acquire(&self, position: Position) -> Option<PositionGuard> {
        self.acquire(position, Duration::ZERO)
    }

    pub fn acquire(&self, position: Position, timeout: Duration) -> Option<PositionGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            let lock = self.lock_for(position);
            let remaining = deadline.saturating_duration_since(Instant::now());
            lock.take(remaining)?;
            let guard = PositionGuard { position, lock };
            // A sweep may have dropped the entry between lookup and lock.
            let current = self.locks().get(&position).cloned();
            match current {
                Some(current) if Arc::ptr_eq(&current, &guard.lock) => return Some(guard),
                _ => {
                    drop(guard);
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
            }
        }
    }

    pub fn release(&self, guard: PositionGuard) {
        drop(guard);
    }

    pub fn is_held(&self, position: Position) -> bool {
        self.locks()
            .get(&position)
            .map_or(false, |lock| lock.is_locked())
    }

    /// Forgets the entry for a destroyed spawn point.
    pub fn remove(&self, position: Position) {
        self.locks().remove(&position);
    }

    pub fn len(&self) -> usize {
        self.locks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks().is_empty()
    }

    /// Drops every unheld entry whose position no longer hosts a spawn
    /// point. Returns the number of entries removed.
    pub fn sweep<F>(&self, occupied: F) -> usize
    where
        F: Fn(Position) -> bool,
    {
        let mut locks = self.locks();
        let before = locks.len();
        locks.retain(|position, lock| {
            if lock.is_locked() {
                return true;
            }
            occupied(*position)
        });
        before - locks.len()
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<Position, Arc<TimedMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::position::WorldId;
    use std::thread;

    fn pos(x: i32) -> Position {
        Position::new(WorldId(0), x, 64, 0)
    }

    #[test]
    fn acquire_is_exclusive_per_position() {
        let registry = PositionLockRegistry::new();
        let guard = registry.try_acquire(pos(1)).expect("first");
        assert!(registry.is_held(pos(1)));
        assert!(registry.try_acquire(pos(1)).is_none());
        assert!(registry.try_acquire(pos(2)).is_some());

        registry.release(guard);
        assert!(!registry.is_held(pos(1)));
        assert!(registry.try_acquire(pos(1)).is_some());
    }

    #[test]
    fn sweep_keeps_held_and_occupied_entries() {
        let registry = PositionLockRegistry::new();
        let _held = registry.try_acquire(pos(1)).expect("held");
        drop(registry.try_acquire(pos(2)));
        drop(registry.try_acquire(pos(3)));

        let removed = registry.sweep(|position| position == pos(3));
        assert_eq!(removed, 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.is_held(pos(1)));
    }

    #[test]
    fn remove_drops_entry() {
        let registry = PositionLockRegistry::new();
        drop(registry.try_acquire(pos(4)));
        assert_eq!(registry.len(), 1);
        registry.remove(pos(4));
        assert!(registry.is_empty());
    }

    #[test]
    fn contended_acquire_serializes_critical_sections() {
        let registry = Arc::new(PositionLockRegistry::new());
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let registry = Arc::clone(&registry);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                let mut entered = 0;
                while entered < 50 {
                    let Some(guard) = registry.acquire(pos(7), Duration::from_millis(5)) else {
                        continue;
                    };
                    let now = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(now, 0);
                    inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    registry.sweep(|_| false);
                    drop(guard);
                    entered += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker");
        }
    }
}
