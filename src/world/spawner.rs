use crate::entities::inventory::{InventoryError, LogicalInventory};
use crate::entities::item::{merge_stacks, ItemKind, ItemStack};
use crate::persistence::autosave::ChangeTracker;
use crate::persistence::store::SpawnerRecord;
use crate::world::economy::{sellable, value_of, Economy, EconomyError, PriceSource};
use crate::world::loot::LootBatch;
use crate::world::participants::ParticipantId;
use crate::world::position::Position;
use crate::world::timed_lock::{TimedGuard, TimedMutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpawnerId(pub u64);

impl fmt::Display for SpawnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(pub String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        EntityType(name.into())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a spawner produces: loot of a creature type, or a plain item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnerKind {
    Entity(EntityType),
    Item(ItemKind),
}

impl fmt::Display for SpawnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnerKind::Entity(entity) => write!(f, "entity:{}", entity),
            SpawnerKind::Item(item) => write!(f, "item:{}", item),
        }
    }
}

/// Rate and capacity of a single spawner; a stack of N scales the batch
/// bounds, experience cap and slot cap by N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerSettings {
    pub min_mobs: u32,
    pub max_mobs: u32,
    pub delay_ms: u64,
    pub max_stored_exp: u64,
    pub max_slots: u64,
    pub range: u32,
}

impl Default for SpawnerSettings {
    fn default() -> Self {
        Self {
            min_mobs: 1,
            max_mobs: 4,
            delay_ms: 25_000,
            max_stored_exp: 1_000,
            max_slots: 45,
            range: 16,
        }
    }
}

/// Guarded by the timing lock.
#[derive(Debug, Clone)]
pub struct SpawnerTiming {
    pub settings: SpawnerSettings,
    pub stack_size: u32,
    pub last_spawn_ms: u64,
    pregenerated: Option<PendingLoot>,
}

#[derive(Debug, Clone)]
struct PendingLoot {
    epoch: u64,
    batch: LootBatch,
}

impl SpawnerTiming {
    pub fn min_mobs(&self) -> u32 {
        self.settings.min_mobs.saturating_mul(self.stack_size)
    }

    pub fn max_mobs(&self) -> u32 {
        self.settings
            .max_mobs
            .max(self.settings.min_mobs)
            .saturating_mul(self.stack_size)
    }

    pub fn max_stored_exp(&self) -> u64 {
        self.settings
            .max_stored_exp
            .saturating_mul(u64::from(self.stack_size))
    }

    pub fn max_slots(&self) -> u64 {
        self.settings
            .max_slots
            .saturating_mul(u64::from(self.stack_size))
    }

    pub fn next_spawn_ms(&self) -> u64 {
        self.last_spawn_ms.saturating_add(self.settings.delay_ms)
    }

    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.next_spawn_ms().saturating_sub(now)
    }

    pub fn has_pregenerated(&self) -> bool {
        self.pregenerated.is_some()
    }
}

/// Running total of what the stored items sell for. Kept in step with
/// every add and remove; `dirty` forces a full recount on next read.
#[derive(Debug, Clone, Copy, Default)]
pub struct SellValue {
    total: f64,
    dirty: bool,
}

impl SellValue {
    fn added(&mut self, prices: &dyn PriceSource, stacks: &[ItemStack]) {
        self.total += value_of(prices, stacks);
    }

    fn removed(&mut self, prices: &dyn PriceSource, stacks: &[ItemStack]) {
        self.total -= value_of(prices, stacks);
        if self.total < -1e-6 {
            self.dirty = true;
        }
    }

    fn current(&mut self, prices: &dyn PriceSource, inventory: &LogicalInventory) -> f64 {
        if self.dirty {
            self.total = value_of(prices, &inventory.consolidated_view());
            self.dirty = false;
        }
        self.total.max(0.0)
    }
}

/// Guarded by the inventory lock.
#[derive(Debug, Clone)]
pub struct SpawnerStorage {
    pub inventory: LogicalInventory,
    pub experience: u64,
    sell_value: SellValue,
}

/// Collaborators shared by every spawner.
pub struct SpawnerContext {
    pub prices: Arc<dyn PriceSource>,
    pub changes: Arc<dyn ChangeTracker>,
    pub lock_timeout: Duration,
}

impl fmt::Debug for SpawnerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnerContext")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum SpawnerError {
    /// A lock could not be taken in time; nothing was changed.
    #[error("spawner {0} is busy")]
    Busy(SpawnerId),
    #[error("spawner {0} was removed")]
    Removed(SpawnerId),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("stack size {requested} outside 1..={max}")]
    InvalidStackSize { requested: u32, max: u32 },
    #[error("sale at spawner {id} failed: deposit rejected: {source}")]
    DepositFailed {
        id: SpawnerId,
        #[source]
        source: EconomyError,
    },
    #[error("sale at spawner {id} failed after deposit: {reason}")]
    SaleDesync { id: SpawnerId, reason: String },
}

/// Snapshot taken under the timing lock at the start of a production cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionPlan {
    pub kind: SpawnerKind,
    pub min_mobs: u32,
    pub max_mobs: u32,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub enum ProductionCheck {
    Inactive,
    Busy,
    InFlight,
    AtCapacity,
    NotDue {
        remaining_ms: u64,
        plan: ProductionPlan,
        /// A speculative batch is already waiting.
        cached: bool,
    },
    Due {
        plan: ProductionPlan,
        pregenerated: Option<LootBatch>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        experience: u64,
        items: u64,
        truncated: u64,
    },
    NothingFit,
    /// The spawner changed while the batch was being rolled.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaleReceipt {
    pub items: Vec<ItemStack>,
    pub value: f64,
}

/// Read model for menus.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnerView {
    pub id: SpawnerId,
    pub position: Position,
    pub kind: SpawnerKind,
    pub stack_size: u32,
    pub active: bool,
    pub at_capacity: bool,
    pub experience: u64,
    pub max_experience: u64,
    pub used_slots: u64,
    pub max_slots: u64,
    pub page: usize,
    pub page_count: usize,
    pub items: Vec<ItemStack>,
    pub remaining_ms: u64,
    pub sell_value: f64,
}

/// One placed spawn point and the unit of concurrency control.
///
/// Lock order is production → storage → sale, with timing taken last and
/// never held while waiting on another lock. Every acquisition is bounded
/// by `SpawnerContext::lock_timeout`; a timeout surfaces as
/// [`SpawnerError::Busy`] with nothing changed.
pub struct Spawner {
    id: SpawnerId,
    position: Position,
    kind: SpawnerKind,
    range: u32,
    timing: TimedMutex<SpawnerTiming>,
    storage: TimedMutex<SpawnerStorage>,
    production: TimedMutex<()>,
    sale: TimedMutex<()>,
    active: AtomicBool,
    no_nearby_participant: AtomicBool,
    suspended: AtomicBool,
    at_capacity: AtomicBool,
    producing: AtomicBool,
    pregenerating: AtomicBool,
    transition_pending: AtomicBool,
    removed: AtomicBool,
    epoch: AtomicU64,
    ctx: Arc<SpawnerContext>,
}

impl fmt::Debug for Spawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawner")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .field("removed", &self.is_removed())
            .finish_non_exhaustive()
    }
}

impl Spawner {
    pub fn new(
        id: SpawnerId,
        position: Position,
        kind: SpawnerKind,
        settings: SpawnerSettings,
        stack_size: u32,
        ctx: Arc<SpawnerContext>,
        now: u64,
    ) -> Self {
        let timing = SpawnerTiming {
            settings,
            stack_size: stack_size.max(1),
            last_spawn_ms: now,
            pregenerated: None,
        };
        let storage = SpawnerStorage {
            inventory: LogicalInventory::new(timing.max_slots()),
            experience: 0,
            sell_value: SellValue::default(),
        };
        Self::assemble(id, position, kind, timing, storage, ctx)
    }

    pub fn from_record(record: SpawnerRecord, ctx: Arc<SpawnerContext>) -> Self {
        let timing = SpawnerTiming {
            settings: record.settings,
            stack_size: record.stack_size.max(1),
            last_spawn_ms: record.last_spawn_ms,
            pregenerated: None,
        };
        let mut inventory = LogicalInventory::new(timing.max_slots());
        inventory.add(record.items);
        inventory.sort_by(record.sort);
        let storage = SpawnerStorage {
            inventory,
            experience: record.experience,
            sell_value: SellValue {
                total: 0.0,
                dirty: true,
            },
        };
        Self::assemble(record.id, record.position, record.kind, timing, storage, ctx)
    }

    fn assemble(
        id: SpawnerId,
        position: Position,
        kind: SpawnerKind,
        timing: SpawnerTiming,
        storage: SpawnerStorage,
        ctx: Arc<SpawnerContext>,
    ) -> Self {
        let at_capacity =
            storage.inventory.is_full() && storage.experience >= timing.max_stored_exp();
        Self {
            id,
            position,
            kind,
            range: timing.settings.range,
            timing: TimedMutex::new(timing),
            storage: TimedMutex::new(storage),
            production: TimedMutex::new(()),
            sale: TimedMutex::new(()),
            active: AtomicBool::new(false),
            no_nearby_participant: AtomicBool::new(true),
            suspended: AtomicBool::new(false),
            at_capacity: AtomicBool::new(at_capacity),
            producing: AtomicBool::new(false),
            pregenerating: AtomicBool::new(false),
            transition_pending: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            ctx,
        }
    }

    pub fn id(&self) -> SpawnerId {
        self.id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn kind(&self) -> &SpawnerKind {
        &self.kind
    }

    pub fn range(&self) -> u32 {
        self.range
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn has_nearby_participant(&self) -> bool {
        !self.no_nearby_participant.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_at_capacity(&self) -> bool {
        self.at_capacity.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn lock_timing(&self) -> Result<TimedGuard<'_, SpawnerTiming>, SpawnerError> {
        self.timing
            .lock_timeout(self.ctx.lock_timeout)
            .ok_or(SpawnerError::Busy(self.id))
    }

    fn lock_storage(&self) -> Result<TimedGuard<'_, SpawnerStorage>, SpawnerError> {
        self.storage
            .lock_timeout(self.ctx.lock_timeout)
            .ok_or(SpawnerError::Busy(self.id))
    }

    fn lock_production(&self) -> Result<TimedGuard<'_, ()>, SpawnerError> {
        self.production
            .lock_timeout(self.ctx.lock_timeout)
            .ok_or(SpawnerError::Busy(self.id))
    }

    fn lock_sale(&self) -> Result<TimedGuard<'_, ()>, SpawnerError> {
        self.sale
            .lock_timeout(self.ctx.lock_timeout)
            .ok_or(SpawnerError::Busy(self.id))
    }

    fn ensure_present(&self) -> Result<(), SpawnerError> {
        if self.is_removed() {
            return Err(SpawnerError::Removed(self.id));
        }
        Ok(())
    }

    /// Records whether an eligible participant is in range and flips the
    /// activation flag when the outcome changes. Returns the new state
    /// when a flip happened; the caller then schedules
    /// [`Spawner::complete_transition`] on the simulation thread.
    pub fn update_proximity(&self, in_range: bool) -> Option<bool> {
        self.no_nearby_participant.store(!in_range, Ordering::SeqCst);
        let target = in_range && !self.is_suspended() && !self.is_removed();
        self.flip_active(target)
    }

    fn flip_active(&self, target: bool) -> Option<bool> {
        if self.is_active() == target {
            return None;
        }
        // Flip and epoch bump happen under the timing lock so a production
        // check never sees one without the other.
        let _timing = self.timing.lock_timeout(self.ctx.lock_timeout)?;
        if self.active.swap(target, Ordering::SeqCst) == target {
            return None;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.transition_pending.store(true, Ordering::SeqCst);
        Some(target)
    }

    /// Simulation-thread half of an activation flip. Entering active
    /// restarts the production timer at `now`; either direction drops any
    /// speculative batch. If the timing lock is busy the next production
    /// check settles it instead.
    pub fn complete_transition(&self, now: u64) -> bool {
        match self.lock_timing() {
            Ok(mut timing) => {
                self.settle_transition(&mut timing, now);
                true
            }
            Err(_) => false,
        }
    }

    fn settle_transition(&self, timing: &mut SpawnerTiming, now: u64) {
        if !self.transition_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        if timing.pregenerated.take().is_some() {
            log::debug!(target: "loot", "spawner {} discarded pre-generated loot", self.id);
        }
        if self.is_active() {
            timing.last_spawn_ms = now;
        }
    }

    /// Pauses production regardless of proximity, e.g. while the area is
    /// unloaded. Resuming waits for the next proximity sweep.
    pub fn set_suspended(&self, suspended: bool) -> Option<bool> {
        self.suspended.store(suspended, Ordering::SeqCst);
        if suspended {
            self.flip_active(false)
        } else {
            None
        }
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Step one of a production cycle.
    pub fn production_check(&self, now: u64) -> ProductionCheck {
        if self.is_removed() || !self.is_active() {
            return ProductionCheck::Inactive;
        }
        if self.producing.load(Ordering::SeqCst) {
            return ProductionCheck::InFlight;
        }
        let Ok(mut timing) = self.lock_timing() else {
            return ProductionCheck::Busy;
        };
        self.settle_transition(&mut timing, now);
        if !self.is_active() {
            return ProductionCheck::Inactive;
        }
        if self.is_at_capacity() {
            return ProductionCheck::AtCapacity;
        }
        let epoch = self.epoch();
        let plan = ProductionPlan {
            kind: self.kind.clone(),
            min_mobs: timing.min_mobs(),
            max_mobs: timing.max_mobs(),
            epoch,
        };
        let remaining_ms = timing.remaining_ms(now);
        if remaining_ms > 0 {
            return ProductionCheck::NotDue {
                remaining_ms,
                plan,
                cached: timing.has_pregenerated(),
            };
        }
        let pregenerated = timing
            .pregenerated
            .take()
            .filter(|pending| pending.epoch == epoch)
            .map(|pending| pending.batch);
        ProductionCheck::Due { plan, pregenerated }
    }

    pub fn begin_production(&self) -> bool {
        self.producing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish_production(&self) {
        self.producing.store(false, Ordering::SeqCst);
    }

    pub fn is_pregenerating(&self) -> bool {
        self.pregenerating.load(Ordering::SeqCst)
    }

    /// Claims the right to roll a speculative batch.
    pub fn begin_pregeneration(&self) -> bool {
        self.pregenerating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Caches a speculative batch if nothing changed since it was planned.
    pub fn store_pregenerated(&self, epoch: u64, batch: LootBatch) -> bool {
        let stored = match self.lock_timing() {
            Ok(mut timing) => {
                if self.is_active() && self.epoch() == epoch && timing.pregenerated.is_none() {
                    timing.pregenerated = Some(PendingLoot { epoch, batch });
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        };
        self.pregenerating.store(false, Ordering::SeqCst);
        stored
    }

    /// Step three of a production cycle: apply a rolled batch if the
    /// spawner is still the one it was rolled for.
    pub fn apply_loot(
        &self,
        epoch: u64,
        batch: LootBatch,
        now: u64,
    ) -> Result<ApplyOutcome, SpawnerError> {
        if self.is_removed() {
            return Ok(ApplyOutcome::Stale);
        }
        let _production = self.lock_production()?;
        let mut storage = self.lock_storage()?;
        let mut timing = self.lock_timing()?;
        if !self.is_active() || self.epoch() != epoch {
            return Ok(ApplyOutcome::Stale);
        }

        let max_exp = timing.max_stored_exp();
        let experience = batch
            .experience
            .min(max_exp.saturating_sub(storage.experience));
        storage.experience += experience;

        let fit = storage.inventory.add_within_capacity(batch.items);
        storage.sell_value.added(self.ctx.prices.as_ref(), &fit.accepted);

        let items = fit.accepted_count();
        let truncated = fit.truncated_count();
        self.at_capacity.store(
            storage.inventory.is_full() && storage.experience >= max_exp,
            Ordering::SeqCst,
        );
        if experience == 0 && items == 0 {
            return Ok(ApplyOutcome::NothingFit);
        }
        timing.last_spawn_ms = now;
        self.ctx.changes.mark_modified(self.id);
        Ok(ApplyOutcome::Applied {
            experience,
            items,
            truncated,
        })
    }

    fn after_removal(&self, storage: &mut SpawnerStorage, removed: &[ItemStack]) {
        storage.sell_value.removed(self.ctx.prices.as_ref(), removed);
        self.at_capacity.store(false, Ordering::SeqCst);
        self.ctx.changes.mark_modified(self.id);
    }

    /// Removes exactly `stacks` or nothing.
    pub fn withdraw(&self, stacks: Vec<ItemStack>) -> Result<Vec<ItemStack>, SpawnerError> {
        self.ensure_present()?;
        let _production = self.lock_production()?;
        let mut storage = self.lock_storage()?;
        storage.inventory.remove(stacks.iter().cloned())?;
        let removed: Vec<ItemStack> = merge_stacks(stacks)
            .into_iter()
            .map(|(signature, count)| ItemStack::new(signature, count))
            .collect();
        self.after_removal(&mut storage, &removed);
        Ok(removed)
    }

    /// Takes the native stacks shown on `page`, at most `free_slots` of them.
    pub fn withdraw_page(
        &self,
        page: usize,
        page_size: usize,
        free_slots: usize,
    ) -> Result<Vec<ItemStack>, SpawnerError> {
        self.ensure_present()?;
        let _production = self.lock_production()?;
        let mut storage = self.lock_storage()?;
        let slots: Vec<ItemStack> = storage
            .inventory
            .page(page, page_size)
            .into_iter()
            .take(free_slots)
            .collect();
        self.take_slots(&mut storage, slots)
    }

    /// Takes native stacks from the front of the layout until the
    /// receiver's `free_slots` are used up.
    pub fn withdraw_all(&self, free_slots: usize) -> Result<Vec<ItemStack>, SpawnerError> {
        self.ensure_present()?;
        let _production = self.lock_production()?;
        let mut storage = self.lock_storage()?;
        let slots: Vec<ItemStack> = storage
            .inventory
            .display_slots()
            .iter()
            .take(free_slots)
            .cloned()
            .collect();
        self.take_slots(&mut storage, slots)
    }

    /// Hands up to `max_slots` native stacks to adjacent machinery. Never
    /// waits: a busy spawner is skipped until the machinery's next pull.
    pub fn siphon(&self, max_slots: usize) -> Result<Vec<ItemStack>, SpawnerError> {
        self.ensure_present()?;
        let _production = self.production.try_lock().ok_or(SpawnerError::Busy(self.id))?;
        let mut storage = self.storage.try_lock().ok_or(SpawnerError::Busy(self.id))?;
        let slots: Vec<ItemStack> = storage
            .inventory
            .display_slots()
            .iter()
            .take(max_slots)
            .cloned()
            .collect();
        self.take_slots(&mut storage, slots)
    }

    fn take_slots(
        &self,
        storage: &mut SpawnerStorage,
        slots: Vec<ItemStack>,
    ) -> Result<Vec<ItemStack>, SpawnerError> {
        if slots.is_empty() {
            return Ok(slots);
        }
        storage.inventory.remove(slots.iter().cloned())?;
        self.after_removal(storage, &slots);
        Ok(slots)
    }

    pub fn withdraw_experience(&self) -> Result<u64, SpawnerError> {
        self.ensure_present()?;
        let _production = self.lock_production()?;
        let mut storage = self.lock_storage()?;
        let experience = std::mem::take(&mut storage.experience);
        if experience > 0 {
            self.at_capacity.store(false, Ordering::SeqCst);
            self.ctx.changes.mark_modified(self.id);
        }
        Ok(experience)
    }

    pub fn sort_by(&self, kind: Option<ItemKind>) -> Result<(), SpawnerError> {
        self.ensure_present()?;
        let _production = self.lock_production()?;
        let mut storage = self.lock_storage()?;
        storage.inventory.sort_by(kind);
        self.ctx.changes.mark_modified(self.id);
        Ok(())
    }

    /// Sells every priced item to `seller`.
    pub fn sell_all(
        &self,
        economy: &dyn Economy,
        seller: ParticipantId,
    ) -> Result<SaleReceipt, SpawnerError> {
        self.ensure_present()?;
        let _production = self.lock_production()?;
        let mut storage = self.lock_storage()?;
        let _sale = self.lock_sale()?;
        let stacks = sellable(economy, storage.inventory.consolidated_view());
        if stacks.is_empty() {
            return Ok(SaleReceipt::default());
        }
        let receipt = settle_sale(self.id, &mut storage.inventory, stacks, economy, seller)?;
        self.after_removal(&mut storage, &receipt.items);
        log::info!(
            "spawner {} sold {} stacks for {:.2} to {:?}",
            self.id,
            receipt.items.len(),
            receipt.value,
            seller
        );
        Ok(receipt)
    }

    pub fn sell_value(&self) -> Result<f64, SpawnerError> {
        let mut storage = self.lock_storage()?;
        let storage = &mut *storage;
        Ok(storage
            .sell_value
            .current(self.ctx.prices.as_ref(), &storage.inventory))
    }

    /// Forces a full recount of the sell value, e.g. after prices reload.
    pub fn invalidate_sell_value(&self) -> Result<(), SpawnerError> {
        self.lock_storage()?.sell_value.dirty = true;
        Ok(())
    }

    pub fn stack_size(&self) -> Result<u32, SpawnerError> {
        Ok(self.lock_timing()?.stack_size)
    }

    /// The only way stack size changes. Capacity follows the new size;
    /// items above a shrunken capacity stay until withdrawn.
    pub fn apply_stack_size(&self, stack_size: u32, max: u32) -> Result<u32, SpawnerError> {
        self.ensure_present()?;
        if stack_size == 0 || stack_size > max {
            return Err(SpawnerError::InvalidStackSize {
                requested: stack_size,
                max,
            });
        }
        let _production = self.lock_production()?;
        let mut storage = self.lock_storage()?;
        let mut timing = self.lock_timing()?;
        if stack_size == timing.stack_size {
            return Ok(stack_size);
        }
        timing.stack_size = stack_size;
        timing.pregenerated = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        storage.inventory.set_max_slots(timing.max_slots());
        self.at_capacity.store(
            storage.inventory.is_full() && storage.experience >= timing.max_stored_exp(),
            Ordering::SeqCst,
        );
        self.ctx.changes.mark_modified(self.id);
        Ok(stack_size)
    }

    pub fn view(
        &self,
        page: usize,
        page_size: usize,
        now: u64,
    ) -> Result<SpawnerView, SpawnerError> {
        let mut storage = self.lock_storage()?;
        let timing = self.lock_timing()?;
        let storage = &mut *storage;
        let page_count = storage.inventory.page_count(page_size);
        let page = page.min(page_count - 1);
        let items = storage.inventory.page(page, page_size);
        let sell_value = storage
            .sell_value
            .current(self.ctx.prices.as_ref(), &storage.inventory);
        Ok(SpawnerView {
            id: self.id,
            position: self.position,
            kind: self.kind.clone(),
            stack_size: timing.stack_size,
            active: self.is_active(),
            at_capacity: self.is_at_capacity(),
            experience: storage.experience,
            max_experience: timing.max_stored_exp(),
            used_slots: storage.inventory.used_slots(),
            max_slots: storage.inventory.max_slots(),
            page,
            page_count,
            items,
            remaining_ms: if self.is_active() {
                timing.remaining_ms(now)
            } else {
                timing.settings.delay_ms
            },
            sell_value,
        })
    }

    #[cfg(test)]
    pub(crate) fn hold_storage_for_test(&self) -> TimedGuard<'_, SpawnerStorage> {
        self.storage.try_lock().expect("storage lock free")
    }

    /// Consistent copy for the store; `Busy` leaves the spawner dirty for
    /// the next flush.
    pub fn to_record(&self) -> Result<SpawnerRecord, SpawnerError> {
        let storage = self.lock_storage()?;
        let timing = self.lock_timing()?;
        Ok(SpawnerRecord {
            id: self.id,
            position: self.position,
            kind: self.kind.clone(),
            settings: timing.settings,
            stack_size: timing.stack_size,
            experience: storage.experience,
            last_spawn_ms: timing.last_spawn_ms,
            sort: storage.inventory.preferred_sort().cloned(),
            items: storage.inventory.consolidated_view(),
        })
    }
}

/// Deposit-then-remove half of a sale. A deposit that fails leaves the
/// items alone; a removal that fails after a deposit takes the money back.
pub(crate) fn settle_sale(
    id: SpawnerId,
    inventory: &mut LogicalInventory,
    stacks: Vec<ItemStack>,
    economy: &dyn Economy,
    seller: ParticipantId,
) -> Result<SaleReceipt, SpawnerError> {
    let value = value_of(economy, &stacks);
    economy
        .deposit(seller, value)
        .map_err(|source| SpawnerError::DepositFailed { id, source })?;
    if let Err(err) = inventory.remove(stacks.iter().cloned()) {
        match economy.reverse_deposit(seller, value) {
            Ok(()) => log::error!(
                target: "exploit",
                "spawner {} sale desync for {:?}: deposit of {:.2} reversed, removal failed: {}",
                id,
                seller,
                value,
                err
            ),
            Err(reverse_err) => log::error!(
                target: "exploit",
                "spawner {} sale desync for {:?}: removal failed ({}), reversing {:.2} failed: {}",
                id,
                seller,
                err,
                value,
                reverse_err
            ),
        }
        return Err(SpawnerError::SaleDesync {
            id,
            reason: err.to_string(),
        });
    }
    Ok(SaleReceipt {
        items: stacks,
        value,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entities::item::ItemSignature;
    use crate::persistence::autosave::DirtyTracker;
    use crate::world::economy::{Ledger, PriceTable};
    use crate::world::position::WorldId;
    use std::thread;

    pub(crate) fn test_context(tracker: Arc<DirtyTracker>) -> Arc<SpawnerContext> {
        let mut prices = PriceTable::new();
        prices.insert(ItemKind::new("bone"), 2.0);
        prices.insert(ItemKind::new("arrow"), 1.0);
        Arc::new(SpawnerContext {
            prices: Arc::new(prices),
            changes: tracker,
            lock_timeout: Duration::from_millis(50),
        })
    }

    pub(crate) fn test_spawner(
        settings: SpawnerSettings,
        now: u64,
    ) -> (Spawner, Arc<DirtyTracker>) {
        let tracker = Arc::new(DirtyTracker::new());
        let spawner = Spawner::new(
            SpawnerId(1),
            Position::new(WorldId(0), 0, 64, 0),
            SpawnerKind::Entity(EntityType::new("skeleton")),
            settings,
            1,
            test_context(Arc::clone(&tracker)),
            now,
        );
        (spawner, tracker)
    }

    fn bone(count: u64) -> ItemStack {
        ItemStack::new(ItemSignature::new(ItemKind::new("bone"), 64), count)
    }

    fn arrow(count: u64) -> ItemStack {
        ItemStack::new(ItemSignature::new(ItemKind::new("arrow"), 64), count)
    }

    fn batch(experience: u64, items: Vec<ItemStack>) -> LootBatch {
        LootBatch { experience, items }
    }

    fn activate(spawner: &Spawner, now: u64) {
        assert_eq!(spawner.update_proximity(true), Some(true));
        assert!(spawner.complete_transition(now));
    }

    struct RejectingEconomy;

    impl PriceSource for RejectingEconomy {
        fn unit_price(&self, _signature: &ItemSignature) -> Option<f64> {
            Some(1.0)
        }
    }

    impl Economy for RejectingEconomy {
        fn deposit(&self, _to: ParticipantId, _amount: f64) -> Result<(), EconomyError> {
            Err(EconomyError::Rejected("bank offline".to_string()))
        }

        fn reverse_deposit(&self, _from: ParticipantId, _amount: f64) -> Result<(), EconomyError> {
            Ok(())
        }
    }

    #[test]
    fn activation_restarts_timer_at_now() {
        let settings = SpawnerSettings {
            delay_ms: 10_000,
            ..SpawnerSettings::default()
        };
        let (spawner, _) = test_spawner(settings, 0);
        activate(&spawner, 1_000_000);
        match spawner.production_check(1_000_000) {
            ProductionCheck::NotDue { remaining_ms, .. } => assert_eq!(remaining_ms, 10_000),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(spawner.update_proximity(false), Some(false));
        spawner.complete_transition(1_000_500);
        activate(&spawner, 5_000_000);
        match spawner.production_check(5_000_000) {
            ProductionCheck::NotDue { remaining_ms, .. } => assert_eq!(remaining_ms, 10_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn pending_transition_is_settled_by_production_check() {
        let (spawner, _) = test_spawner(SpawnerSettings::default(), 0);
        assert_eq!(spawner.update_proximity(true), Some(true));
        match spawner.production_check(900_000) {
            ProductionCheck::NotDue { remaining_ms, .. } => assert_eq!(remaining_ms, 25_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn apply_is_clamped_and_marks_dirty() {
        let settings = SpawnerSettings {
            max_slots: 2,
            max_stored_exp: 50,
            ..SpawnerSettings::default()
        };
        let (spawner, tracker) = test_spawner(settings, 0);
        activate(&spawner, 0);
        let epoch = spawner.epoch();

        let outcome = spawner
            .apply_loot(epoch, batch(80, vec![bone(100), arrow(100)]), 30_000)
            .expect("apply");
        // Both signatures need two new slots; signature order lets arrows in.
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                experience: 50,
                items: 100,
                truncated: 100,
            }
        );
        assert!(spawner.is_at_capacity());
        assert!(matches!(
            spawner.production_check(90_000),
            ProductionCheck::AtCapacity
        ));
        assert_eq!(tracker.take().modified, vec![SpawnerId(1)]);

        assert!(spawner.withdraw(vec![bone(1)]).is_err());
        spawner.withdraw(vec![arrow(10)]).expect("withdraw");
        assert!(!spawner.is_at_capacity());
    }

    #[test]
    fn stale_epoch_is_discarded() {
        let (spawner, _) = test_spawner(SpawnerSettings::default(), 0);
        activate(&spawner, 0);
        let epoch = spawner.epoch();
        spawner.update_proximity(false);
        let outcome = spawner
            .apply_loot(epoch, batch(5, vec![bone(3)]), 30_000)
            .expect("apply");
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(spawner.view(0, 45, 0).expect("view").used_slots, 0);
    }

    #[test]
    fn pregenerated_loot_is_not_double_counted_after_reactivation() {
        let settings = SpawnerSettings {
            delay_ms: 1_000,
            ..SpawnerSettings::default()
        };
        let (spawner, _) = test_spawner(settings, 0);
        activate(&spawner, 0);

        assert!(spawner.begin_pregeneration());
        assert!(spawner.store_pregenerated(spawner.epoch(), batch(0, vec![bone(7)])));

        spawner.update_proximity(false);
        spawner.complete_transition(500);
        activate(&spawner, 600);

        match spawner.production_check(1_600) {
            ProductionCheck::Due { plan, pregenerated } => {
                assert!(pregenerated.is_none());
                spawner
                    .apply_loot(plan.epoch, batch(0, vec![bone(2)]), 1_600)
                    .expect("apply");
            }
            other => panic!("unexpected {:?}", other),
        }
        let view = spawner.view(0, 45, 1_600).expect("view");
        assert_eq!(view.items, vec![bone(2)]);
    }

    #[test]
    fn pregeneration_from_old_epoch_is_refused() {
        let (spawner, _) = test_spawner(SpawnerSettings::default(), 0);
        activate(&spawner, 0);
        let epoch = spawner.epoch();
        assert!(spawner.begin_pregeneration());
        assert!(!spawner.begin_pregeneration());
        spawner.update_proximity(false);
        assert!(!spawner.store_pregenerated(epoch, batch(1, vec![bone(1)])));
        assert!(!spawner.is_pregenerating());
    }

    #[test]
    fn deposit_failure_keeps_items() {
        let (spawner, _) = test_spawner(SpawnerSettings::default(), 0);
        activate(&spawner, 0);
        spawner
            .apply_loot(spawner.epoch(), batch(0, vec![bone(10)]), 30_000)
            .expect("apply");

        let err = spawner
            .sell_all(&RejectingEconomy, ParticipantId(1))
            .expect_err("deposit fails");
        assert!(matches!(err, SpawnerError::DepositFailed { .. }));
        assert_eq!(spawner.view(0, 45, 0).expect("view").items, vec![bone(10)]);
    }

    #[test]
    fn removal_failure_after_deposit_reverses_it() {
        let mut prices = PriceTable::new();
        prices.insert(ItemKind::new("bone"), 3.0);
        let ledger = Ledger::new(prices);
        let seller = ParticipantId(4);
        let mut inventory = LogicalInventory::new(10);
        inventory.add(vec![bone(5)]);

        let err = settle_sale(SpawnerId(9), &mut inventory, vec![bone(6)], &ledger, seller)
            .expect_err("stale snapshot");
        assert!(matches!(err, SpawnerError::SaleDesync { .. }));
        assert_eq!(ledger.balance(seller), 0.0);
        assert_eq!(inventory.total_count(), 5);
    }

    #[test]
    fn sale_deposits_and_removes() {
        let mut prices = PriceTable::new();
        prices.insert(ItemKind::new("bone"), 2.0);
        let ledger = Ledger::new(prices);
        let (spawner, _) = test_spawner(SpawnerSettings::default(), 0);
        activate(&spawner, 0);
        spawner
            .apply_loot(spawner.epoch(), batch(0, vec![bone(10), arrow(3)]), 30_000)
            .expect("apply");
        assert_eq!(spawner.sell_value().expect("value"), 23.0);

        let receipt = spawner.sell_all(&ledger, ParticipantId(2)).expect("sell");
        assert_eq!(receipt.value, 20.0);
        assert_eq!(ledger.balance(ParticipantId(2)), 20.0);
        let view = spawner.view(0, 45, 0).expect("view");
        assert_eq!(view.items, vec![arrow(3)]);
        assert_eq!(view.sell_value, 3.0);
    }

    #[test]
    fn busy_production_lock_aborts_withdraw_without_change() {
        let (spawner, _) = test_spawner(SpawnerSettings::default(), 0);
        activate(&spawner, 0);
        spawner
            .apply_loot(spawner.epoch(), batch(0, vec![bone(10)]), 30_000)
            .expect("apply");

        let held = spawner.production.try_lock().expect("hold production");
        assert!(matches!(
            spawner.withdraw(vec![bone(1)]),
            Err(SpawnerError::Busy(_))
        ));
        assert!(matches!(spawner.siphon(1), Err(SpawnerError::Busy(_))));
        drop(held);
        assert_eq!(spawner.siphon(1).expect("siphon"), vec![bone(10)]);
    }

    #[test]
    fn withdraw_page_respects_free_slots() {
        let settings = SpawnerSettings {
            max_slots: 10,
            ..SpawnerSettings::default()
        };
        let (spawner, _) = test_spawner(settings, 0);
        activate(&spawner, 0);
        spawner
            .apply_loot(spawner.epoch(), batch(12, vec![bone(200)]), 30_000)
            .expect("apply");

        let taken = spawner.withdraw_page(0, 45, 2).expect("page");
        assert_eq!(taken, vec![bone(64), bone(64)]);
        assert_eq!(spawner.withdraw_all(9).expect("all"), vec![bone(64), bone(8)]);
        assert_eq!(spawner.withdraw_experience().expect("exp"), 12);
        assert_eq!(spawner.withdraw_experience().expect("exp"), 0);
    }

    #[test]
    fn stack_size_scales_capacity() {
        let settings = SpawnerSettings {
            max_slots: 5,
            min_mobs: 1,
            max_mobs: 2,
            ..SpawnerSettings::default()
        };
        let (spawner, tracker) = test_spawner(settings, 0);
        assert_eq!(spawner.apply_stack_size(3, 10).expect("stack"), 3);
        assert!(matches!(
            spawner.apply_stack_size(13, 10),
            Err(SpawnerError::InvalidStackSize { requested: 13, max: 10 })
        ));
        assert!(matches!(
            spawner.apply_stack_size(0, 10),
            Err(SpawnerError::InvalidStackSize { requested: 0, .. })
        ));
        assert_eq!(tracker.take().modified, vec![SpawnerId(1)]);
        let view = spawner.view(0, 45, 0).expect("view");
        assert_eq!(view.max_slots, 15);

        activate(&spawner, 0);
        match spawner.production_check(0) {
            ProductionCheck::NotDue { plan, .. } => {
                assert_eq!((plan.min_mobs, plan.max_mobs), (3, 6));
            }
            other => panic!("unexpected {:?}", other),
        }
        let epoch = spawner.epoch();
        assert_eq!(spawner.apply_stack_size(2, 10).expect("shrink"), 2);
        assert_eq!(spawner.stack_size().expect("size"), 2);
        assert!(spawner.epoch() > epoch);
        assert_eq!(spawner.view(0, 45, 0).expect("view").max_slots, 10);
    }

    #[test]
    fn invalidated_sell_value_is_recounted() {
        let (spawner, _) = test_spawner(SpawnerSettings::default(), 0);
        activate(&spawner, 0);
        spawner
            .apply_loot(spawner.epoch(), batch(0, vec![bone(10), arrow(4)]), 30_000)
            .expect("apply");
        spawner.withdraw(vec![bone(3)]).expect("withdraw");
        spawner.invalidate_sell_value().expect("invalidate");

        let record = spawner.to_record().expect("record");
        let expected = value_of(spawner.ctx.prices.as_ref(), &record.items);
        assert_eq!(expected, 18.0);
        assert_eq!(spawner.sell_value().expect("value"), expected);
    }

    #[test]
    fn sort_waits_for_production() {
        let (spawner, _) = test_spawner(SpawnerSettings::default(), 0);
        let held = spawner.production.try_lock().expect("hold production");
        assert!(matches!(
            spawner.sort_by(Some(ItemKind::new("arrow"))),
            Err(SpawnerError::Busy(_))
        ));
        drop(held);
        spawner.sort_by(Some(ItemKind::new("arrow"))).expect("sort");
        assert_eq!(
            spawner.to_record().expect("record").sort,
            Some(ItemKind::new("arrow"))
        );
    }

    #[test]
    fn concurrent_apply_and_withdraw_match_oracle() {
        let settings = SpawnerSettings {
            max_slots: 1_000,
            ..SpawnerSettings::default()
        };
        let (spawner, _) = test_spawner(settings, 0);
        let spawner = Arc::new(spawner);
        activate(&spawner, 0);
        let epoch = spawner.epoch();

        let producer = {
            let spawner = Arc::clone(&spawner);
            thread::spawn(move || {
                let mut added = 0u64;
                for round in 0..400u64 {
                    let count = round % 7 + 1;
                    if let Ok(ApplyOutcome::Applied { items, .. }) =
                        spawner.apply_loot(epoch, batch(0, vec![bone(count)]), round)
                    {
                        added += items;
                    }
                }
                added
            })
        };
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let spawner = Arc::clone(&spawner);
            consumers.push(thread::spawn(move || {
                let mut taken = 0u64;
                for round in 0..400u64 {
                    let count = round % 3 + 1;
                    if spawner.withdraw(vec![bone(count)]).is_ok() {
                        taken += count;
                    }
                }
                taken
            }));
        }

        let added = producer.join().expect("producer");
        let taken: u64 = consumers
            .into_iter()
            .map(|handle| handle.join().expect("consumer"))
            .sum();
        let record = spawner.to_record().expect("record");
        let held: u64 = record.items.iter().map(|stack| stack.count).sum();
        assert_eq!(held, added - taken);
    }
}
