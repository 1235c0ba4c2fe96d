use crate::config::{read_yaml_or_default, ConfigError};
use crate::entities::item::{merge_stacks, ItemKind, ItemSignature, ItemStack, QualityFingerprint};
use crate::world::item_types::ItemTypeIndex;
use crate::world::scheduler::TaskScheduler;
use crate::world::spawner::{
    ApplyOutcome, EntityType, ProductionCheck, ProductionPlan, Spawner, SpawnerError, SpawnerKind,
};
use crate::world::time::Clock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// One possible drop. Every spawned unit rolls `chance` once; the amount
/// per successful unit is uniform in `min_amount..=max_amount`.
#[derive(Debug, Clone, PartialEq)]
pub struct LootEntry {
    pub signature: ItemSignature,
    pub min_amount: u64,
    pub max_amount: u64,
    /// Percent, `0.0..=100.0`.
    pub chance: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LootTable {
    /// Experience per spawned unit.
    pub experience: u64,
    pub entries: Vec<LootEntry>,
}

/// Items and experience rolled for one production cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LootBatch {
    pub experience: u64,
    pub items: Vec<ItemStack>,
}

impl LootBatch {
    pub fn is_empty(&self) -> bool {
        self.experience == 0 && self.items.is_empty()
    }

    pub fn item_count(&self) -> u64 {
        self.items.iter().map(|stack| stack.count).sum()
    }
}

/// Rolls one batch. Signatures come back merged and in signature order.
pub fn roll_batch<R: Rng + ?Sized>(
    table: &LootTable,
    min_mobs: u32,
    max_mobs: u32,
    rng: &mut R,
) -> LootBatch {
    let low = min_mobs.min(max_mobs);
    let high = max_mobs.max(min_mobs);
    let units = u64::from(rng.gen_range(low..=high));
    let mut items = Vec::new();
    for entry in &table.entries {
        let chance = (entry.chance / 100.0).clamp(0.0, 1.0);
        let successes = (0..units).filter(|_| rng.gen_bool(chance)).count() as u64;
        if successes == 0 {
            continue;
        }
        let low = entry.min_amount.min(entry.max_amount);
        let high = entry.max_amount.max(entry.min_amount);
        let amount = rng.gen_range(low..=high).saturating_mul(successes);
        if amount > 0 {
            items.push(ItemStack::new(entry.signature.clone(), amount));
        }
    }
    LootBatch {
        experience: table.experience.saturating_mul(units),
        items: merge_stacks(items)
            .into_iter()
            .map(|(signature, count)| ItemStack::new(signature, count))
            .collect(),
    }
}

fn default_amount() -> u64 {
    1
}

fn default_chance() -> f64 {
    100.0
}

#[derive(Debug, Deserialize)]
struct LootDropConfig {
    item: ItemKind,
    #[serde(default = "default_amount")]
    min_amount: u64,
    #[serde(default = "default_amount")]
    max_amount: u64,
    #[serde(default = "default_chance")]
    chance: f64,
    #[serde(default)]
    quality: QualityFingerprint,
}

#[derive(Debug, Default, Deserialize)]
struct LootTableConfig {
    #[serde(default)]
    experience: u64,
    #[serde(default)]
    drops: Vec<LootDropConfig>,
}

/// Loot tables per entity type, resolved against the item index.
#[derive(Debug, Default, Clone)]
pub struct LootRegistry {
    tables: HashMap<EntityType, LootTable>,
    items: ItemTypeIndex,
}

impl LootRegistry {
    pub fn new(items: ItemTypeIndex) -> Self {
        Self {
            tables: HashMap::new(),
            items,
        }
    }

    /// Reads `loot.yml`, a map from entity type to its table.
    pub fn load(path: &Path, items: ItemTypeIndex) -> Result<Self, ConfigError> {
        let config: BTreeMap<EntityType, LootTableConfig> = read_yaml_or_default(path)?;
        let mut registry = Self::new(items);
        for (entity, table) in config {
            let mut entries = Vec::with_capacity(table.drops.len());
            for drop in table.drops {
                if !registry.items.contains(&drop.item) {
                    return Err(ConfigError::Invalid(format!(
                        "loot table {} references unknown item {}",
                        entity, drop.item
                    )));
                }
                if !(0.0..=100.0).contains(&drop.chance) {
                    return Err(ConfigError::Invalid(format!(
                        "loot table {} gives {} a chance of {}",
                        entity, drop.item, drop.chance
                    )));
                }
                let max_stack = registry.items.signature(&drop.item).max_stack() as u16;
                entries.push(LootEntry {
                    signature: ItemSignature::with_quality(drop.item, max_stack, drop.quality),
                    min_amount: drop.min_amount,
                    max_amount: drop.max_amount,
                    chance: drop.chance,
                });
            }
            registry.insert(
                entity,
                LootTable {
                    experience: table.experience,
                    entries,
                },
            );
        }
        Ok(registry)
    }

    pub fn insert(&mut self, entity: EntityType, table: LootTable) {
        self.tables.insert(entity, table);
    }

    pub fn items(&self) -> &ItemTypeIndex {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Item spawners always drop exactly one of their item per unit.
    pub fn table_for(&self, kind: &SpawnerKind) -> Option<LootTable> {
        match kind {
            SpawnerKind::Entity(entity) => self.tables.get(entity).cloned(),
            SpawnerKind::Item(item) => Some(LootTable {
                experience: 0,
                entries: vec![LootEntry {
                    signature: self.items.signature(item),
                    min_amount: 1,
                    max_amount: 1,
                    chance: 100.0,
                }],
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Busy,
    InFlight,
    AtCapacity,
    NotDue,
    Pregenerating,
    Dispatched,
    /// A cached batch was handed to the simulation thread.
    DispatchedCached,
    NoLootTable,
}

/// Drives production cycles: checks the timer, rolls off the simulation
/// thread and hands the batch back to the spawner's region to apply.
pub struct LootGenerator {
    loot: Arc<LootRegistry>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    pregeneration_threshold_ms: u64,
    seeds: Mutex<ChaCha8Rng>,
}

impl LootGenerator {
    pub fn new(
        loot: Arc<LootRegistry>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
        pregeneration_threshold_ms: u64,
        seed: u64,
    ) -> Self {
        Self {
            loot,
            scheduler,
            clock,
            pregeneration_threshold_ms,
            seeds: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn loot(&self) -> &LootRegistry {
        &self.loot
    }

    fn next_rng(&self) -> ChaCha8Rng {
        let seed = self
            .seeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<u64>();
        ChaCha8Rng::seed_from_u64(seed)
    }

    /// One "time to produce?" check for an active spawner.
    pub fn tick(&self, spawner: &Arc<Spawner>) -> TickOutcome {
        let now = self.clock.now_ms();
        match spawner.production_check(now) {
            ProductionCheck::Inactive => TickOutcome::Idle,
            ProductionCheck::Busy => TickOutcome::Busy,
            ProductionCheck::InFlight => TickOutcome::InFlight,
            ProductionCheck::AtCapacity => TickOutcome::AtCapacity,
            ProductionCheck::NotDue {
                remaining_ms,
                plan,
                cached,
            } => {
                if cached
                    || remaining_ms > self.pregeneration_threshold_ms
                    || spawner.is_pregenerating()
                {
                    return TickOutcome::NotDue;
                }
                match self.loot.table_for(&plan.kind) {
                    Some(table) if spawner.begin_pregeneration() => {
                        self.pregenerate(spawner, plan, table);
                        TickOutcome::Pregenerating
                    }
                    _ => TickOutcome::NotDue,
                }
            }
            ProductionCheck::Due {
                plan,
                pregenerated: Some(batch),
            } => {
                if !spawner.begin_production() {
                    return TickOutcome::InFlight;
                }
                self.apply_on_region(spawner, plan.epoch, batch);
                TickOutcome::DispatchedCached
            }
            ProductionCheck::Due {
                plan,
                pregenerated: None,
            } => {
                let Some(table) = self.loot.table_for(&plan.kind) else {
                    log::warn!(
                        target: "loot",
                        "spawner {} has no loot table for {}",
                        spawner.id(),
                        plan.kind
                    );
                    return TickOutcome::NoLootTable;
                };
                if !spawner.begin_production() {
                    return TickOutcome::InFlight;
                }
                self.dispatch(spawner, plan, table);
                TickOutcome::Dispatched
            }
        }
    }

    fn pregenerate(&self, spawner: &Arc<Spawner>, plan: ProductionPlan, table: LootTable) {
        let spawner = Arc::clone(spawner);
        let mut rng = self.next_rng();
        self.scheduler.run_background(Box::new(move || {
            let batch = roll_batch(&table, plan.min_mobs, plan.max_mobs, &mut rng);
            if !spawner.store_pregenerated(plan.epoch, batch) {
                log::debug!(
                    target: "loot",
                    "spawner {} dropped a speculative batch",
                    spawner.id()
                );
            }
        }));
    }

    fn dispatch(&self, spawner: &Arc<Spawner>, plan: ProductionPlan, table: LootTable) {
        let spawner = Arc::clone(spawner);
        let scheduler = Arc::clone(&self.scheduler);
        let clock = Arc::clone(&self.clock);
        let mut rng = self.next_rng();
        self.scheduler.run_background(Box::new(move || {
            let batch = roll_batch(&table, plan.min_mobs, plan.max_mobs, &mut rng);
            let position = spawner.position();
            scheduler.run_at(
                position,
                Box::new(move || apply_batch(&spawner, plan.epoch, batch, clock.now_ms())),
            );
        }));
    }

    fn apply_on_region(&self, spawner: &Arc<Spawner>, epoch: u64, batch: LootBatch) {
        let spawner = Arc::clone(spawner);
        let clock = Arc::clone(&self.clock);
        let position = spawner.position();
        self.scheduler.run_at(
            position,
            Box::new(move || apply_batch(&spawner, epoch, batch, clock.now_ms())),
        );
    }
}

fn apply_batch(spawner: &Spawner, epoch: u64, batch: LootBatch, now: u64) {
    let result = spawner.apply_loot(epoch, batch, now);
    spawner.finish_production();
    match result {
        Ok(ApplyOutcome::Applied {
            experience,
            items,
            truncated,
        }) => {
            log::debug!(
                target: "loot",
                "spawner {} produced {} items and {} experience",
                spawner.id(),
                items,
                experience
            );
            if truncated > 0 {
                log::info!(
                    target: "loot",
                    "spawner {} is full; {} items truncated",
                    spawner.id(),
                    truncated
                );
            }
        }
        Ok(ApplyOutcome::NothingFit) => {
            log::debug!(target: "loot", "spawner {} had no room for its batch", spawner.id());
        }
        Ok(ApplyOutcome::Stale) => {
            log::debug!(target: "loot", "spawner {} changed; batch discarded", spawner.id());
        }
        Err(SpawnerError::Busy(id)) => {
            log::debug!(target: "loot", "spawner {} busy; production retried next cycle", id);
        }
        Err(err) => log::warn!(target: "loot", "spawner {} apply failed: {}", spawner.id(), err),
    }
}
