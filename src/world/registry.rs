use crate::world::position::Position;
use crate::world::position_locks::{PositionGuard, PositionLockRegistry};
use crate::world::spawner::{
    Spawner, SpawnerContext, SpawnerError, SpawnerId, SpawnerKind, SpawnerSettings,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("position {0} is busy")]
    Busy(Position),
    #[error("position {0} already holds a spawner")]
    Occupied(Position),
    #[error("no spawner at {0}")]
    NotFound(Position),
    #[error("cannot stack {requested} onto {existing} at {position}")]
    KindMismatch {
        position: Position,
        existing: SpawnerKind,
        requested: SpawnerKind,
    },
    #[error(transparent)]
    Spawner(#[from] SpawnerError),
}

#[derive(Debug)]
pub enum Destacked {
    Remaining(u32),
    Removed(Arc<Spawner>),
}

#[derive(Debug, Default)]
struct Index {
    by_id: HashMap<SpawnerId, Arc<Spawner>>,
    by_position: HashMap<Position, SpawnerId>,
}

/// Every placed spawner, by id and by position. Placement, stacking and
/// removal at a position run under that position's lock.
#[derive(Debug)]
pub struct SpawnerRegistry {
    index: RwLock<Index>,
    locks: PositionLockRegistry,
    next_id: AtomicU64,
    ctx: Arc<SpawnerContext>,
    max_stack_size: u32,
}

impl SpawnerRegistry {
    pub fn new(ctx: Arc<SpawnerContext>, max_stack_size: u32) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            locks: PositionLockRegistry::new(),
            next_id: AtomicU64::new(1),
            ctx,
            max_stack_size: max_stack_size.max(1),
        }
    }

    pub fn context(&self) -> &Arc<SpawnerContext> {
        &self.ctx
    }

    pub fn locks(&self) -> &PositionLockRegistry {
        &self.locks
    }

    pub fn max_stack_size(&self) -> u32 {
        self.max_stack_size
    }

    fn guard(&self, position: Position) -> Result<PositionGuard, RegistryError> {
        self.locks
            .acquire(position, self.ctx.lock_timeout)
            .ok_or(RegistryError::Busy(position))
    }

    pub fn place(
        &self,
        position: Position,
        kind: SpawnerKind,
        settings: SpawnerSettings,
        stack_size: u32,
        now: u64,
    ) -> Result<Arc<Spawner>, RegistryError> {
        let _guard = self.guard(position)?;
        if self.contains_position(position) {
            return Err(RegistryError::Occupied(position));
        }
        if stack_size == 0 || stack_size > self.max_stack_size {
            return Err(SpawnerError::InvalidStackSize {
                requested: stack_size,
                max: self.max_stack_size,
            }
            .into());
        }
        let id = SpawnerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let spawner = Arc::new(Spawner::new(
            id,
            position,
            kind,
            settings,
            stack_size,
            Arc::clone(&self.ctx),
            now,
        ));
        self.insert_arc(Arc::clone(&spawner));
        self.ctx.changes.mark_modified(id);
        log::info!(
            "placed spawner {} ({}) x{} at {}",
            id,
            spawner.kind(),
            stack_size,
            position
        );
        Ok(spawner)
    }

    /// Registers a spawner rebuilt from storage.
    pub fn insert(&self, spawner: Spawner) -> Result<Arc<Spawner>, RegistryError> {
        let position = spawner.position();
        let _guard = self.guard(position)?;
        if self.contains_position(position) {
            return Err(RegistryError::Occupied(position));
        }
        self.next_id
            .fetch_max(spawner.id().0.saturating_add(1), Ordering::SeqCst);
        let spawner = Arc::new(spawner);
        self.insert_arc(Arc::clone(&spawner));
        Ok(spawner)
    }

    fn insert_arc(&self, spawner: Arc<Spawner>) {
        let mut index = self.write();
        index.by_position.insert(spawner.position(), spawner.id());
        index.by_id.insert(spawner.id(), spawner);
    }

    pub fn get(&self, id: SpawnerId) -> Option<Arc<Spawner>> {
        self.read().by_id.get(&id).cloned()
    }

    pub fn at(&self, position: Position) -> Option<Arc<Spawner>> {
        let index = self.read();
        let id = index.by_position.get(&position)?;
        index.by_id.get(id).cloned()
    }

    pub fn contains_position(&self, position: Position) -> bool {
        self.read().by_position.contains_key(&position)
    }

    pub fn all(&self) -> Vec<Arc<Spawner>> {
        let mut spawners: Vec<_> = self.read().by_id.values().cloned().collect();
        spawners.sort_by_key(|spawner| spawner.id());
        spawners
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    /// Removes the spawner at `position`. In-flight production for it is
    /// discarded when it tries to apply.
    pub fn break_at(&self, position: Position) -> Result<Arc<Spawner>, RegistryError> {
        let guard = self.guard(position)?;
        let spawner = self.at(position).ok_or(RegistryError::NotFound(position))?;
        self.unregister(&spawner);
        self.locks.remove(position);
        drop(guard);
        Ok(spawner)
    }

    fn unregister(&self, spawner: &Spawner) {
        spawner.mark_removed();
        {
            let mut index = self.write();
            index.by_position.remove(&spawner.position());
            index.by_id.remove(&spawner.id());
        }
        self.ctx.changes.mark_deleted(spawner.id());
        log::info!(
            "removed spawner {} at {}",
            spawner.id(),
            spawner.position()
        );
    }

    /// Adds `amount` spawners of `kind` onto the stack at `position`.
    pub fn stack(
        &self,
        position: Position,
        kind: &SpawnerKind,
        amount: u32,
    ) -> Result<u32, RegistryError> {
        let _guard = self.guard(position)?;
        let spawner = self.at(position).ok_or(RegistryError::NotFound(position))?;
        if spawner.kind() != kind {
            return Err(RegistryError::KindMismatch {
                position,
                existing: spawner.kind().clone(),
                requested: kind.clone(),
            });
        }
        let current = spawner.stack_size()?;
        let requested = current.saturating_add(amount);
        Ok(spawner.apply_stack_size(requested, self.max_stack_size)?)
    }

    /// Takes `amount` off the stack; taking the last one removes it.
    pub fn destack(&self, position: Position, amount: u32) -> Result<Destacked, RegistryError> {
        let guard = self.guard(position)?;
        let spawner = self.at(position).ok_or(RegistryError::NotFound(position))?;
        let current = spawner.stack_size()?;
        if amount >= current {
            self.unregister(&spawner);
            // Drop the entry while still holding its lock so a waiter on
            // the old lock fails its re-check.
            self.locks.remove(position);
            drop(guard);
            return Ok(Destacked::Removed(spawner));
        }
        let remaining = spawner.apply_stack_size(current - amount, current)?;
        Ok(Destacked::Remaining(remaining))
    }

    /// Reclaims position locks that no longer guard a spawner.
    pub fn sweep_locks(&self) -> usize {
        self.locks
            .sweep(|position| self.contains_position(position))
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::autosave::DirtyTracker;
    use crate::world::position::WorldId;
    use crate::world::spawner::tests::test_context;
    use crate::world::spawner::EntityType;
    use std::thread;

    fn registry() -> (SpawnerRegistry, Arc<DirtyTracker>) {
        let tracker = Arc::new(DirtyTracker::new());
        (
            SpawnerRegistry::new(test_context(Arc::clone(&tracker)), 5),
            tracker,
        )
    }

    fn pos(x: i32) -> Position {
        Position::new(WorldId(0), x, 64, 0)
    }

    fn zombie() -> SpawnerKind {
        SpawnerKind::Entity(EntityType::new("zombie"))
    }

    #[test]
    fn place_rejects_occupied_and_oversized() {
        let (registry, _) = registry();
        let spawner = registry
            .place(pos(1), zombie(), SpawnerSettings::default(), 1, 0)
            .expect("place");
        assert_eq!(registry.at(pos(1)).map(|s| s.id()), Some(spawner.id()));
        assert!(matches!(
            registry.place(pos(1), zombie(), SpawnerSettings::default(), 1, 0),
            Err(RegistryError::Occupied(_))
        ));
        assert!(matches!(
            registry.place(pos(2), zombie(), SpawnerSettings::default(), 6, 0),
            Err(RegistryError::Spawner(SpawnerError::InvalidStackSize { .. }))
        ));
    }

    #[test]
    fn stack_and_destack_to_removal() {
        let (registry, tracker) = registry();
        let spawner = registry
            .place(pos(1), zombie(), SpawnerSettings::default(), 2, 0)
            .expect("place");
        assert_eq!(registry.stack(pos(1), &zombie(), 2).expect("stack"), 4);
        assert!(matches!(
            registry.stack(pos(1), &SpawnerKind::Entity(EntityType::new("cow")), 1),
            Err(RegistryError::KindMismatch { .. })
        ));
        assert!(registry.stack(pos(1), &zombie(), 2).is_err());

        assert!(matches!(
            registry.destack(pos(1), 1).expect("destack"),
            Destacked::Remaining(3)
        ));
        assert!(matches!(
            registry.destack(pos(1), 10).expect("destack all"),
            Destacked::Removed(_)
        ));
        assert!(spawner.is_removed());
        assert!(registry.is_empty());
        assert!(registry.locks().is_empty());
        assert_eq!(tracker.take().deleted, vec![spawner.id()]);
    }

    #[test]
    fn break_releases_position() {
        let (registry, _) = registry();
        registry
            .place(pos(3), zombie(), SpawnerSettings::default(), 1, 0)
            .expect("place");
        registry.break_at(pos(3)).expect("break");
        assert!(matches!(
            registry.break_at(pos(3)),
            Err(RegistryError::NotFound(_))
        ));
        registry
            .place(pos(3), zombie(), SpawnerSettings::default(), 1, 0)
            .expect("place again");
    }

    #[test]
    fn held_position_lock_makes_placement_busy() {
        let (registry, _) = registry();
        let guard = registry.locks().try_acquire(pos(4)).expect("hold");
        assert!(matches!(
            registry.place(pos(4), zombie(), SpawnerSettings::default(), 1, 0),
            Err(RegistryError::Busy(_))
        ));
        drop(guard);
        assert_eq!(registry.sweep_locks(), 1);
    }

    #[test]
    fn inserted_records_advance_next_id() {
        let (registry, tracker) = registry();
        let loaded = Spawner::new(
            SpawnerId(40),
            pos(9),
            zombie(),
            SpawnerSettings::default(),
            1,
            test_context(tracker),
            0,
        );
        registry.insert(loaded).expect("insert");
        let placed = registry
            .place(pos(10), zombie(), SpawnerSettings::default(), 1, 0)
            .expect("place");
        assert_eq!(placed.id(), SpawnerId(41));
    }

    #[test]
    fn concurrent_placement_at_one_position_yields_one_spawner() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                registry
                    .place(pos(7), zombie(), SpawnerSettings::default(), 1, 0)
                    .is_ok()
            }));
        }
        let placed = handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .filter(|ok| *ok)
            .count();
        assert_eq!(placed, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn churn_at_one_position_leaves_no_orphans() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    let _ = registry.place(pos(7), zombie(), SpawnerSettings::default(), 1, 0);
                    let _ = registry.break_at(pos(7));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker");
        }
        let _ = registry.break_at(pos(7));
        assert!(registry.all().is_empty());
        assert!(!registry.contains_position(pos(7)));
    }
}
