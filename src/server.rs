use crate::config::ServerSettings;
use crate::entities::item::ItemStack;
use crate::persistence::autosave::{
    flush_dirty, AutosaveConfig, AutosaveState, DirtyTracker, FlushReport,
};
use crate::persistence::store::SpawnerStore;
use crate::world::activation::{ActivationChecker, CycleReport};
use crate::world::economy::{Economy, PriceSource};
use crate::world::loot::LootGenerator;
use crate::world::loot::LootRegistry;
use crate::world::participants::{ParticipantId, ParticipantSource};
use crate::world::position::Position;
use crate::world::registry::{RegistryError, SpawnerRegistry};
use crate::world::scheduler::{TaskScheduler, WorkerScheduler};
use crate::world::spawner::{
    SaleReceipt, Spawner, SpawnerContext, SpawnerError, SpawnerKind, SpawnerView,
};
use crate::world::time::Clock;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerSignal {
    Running = 0,
    Shutdown = 1,
}

#[derive(Debug)]
pub struct ServerControl {
    signal: AtomicU8,
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            signal: AtomicU8::new(ServerSignal::Running as u8),
        }
    }

    pub fn request_shutdown(&self) {
        self.signal.store(ServerSignal::Shutdown as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.signal.load(Ordering::SeqCst) == ServerSignal::Running as u8
    }
}

/// Everything the host needs to run spawners: the registry, its store,
/// the production pipeline and the worker pool it dispatches to.
pub struct SpawnerService {
    settings: ServerSettings,
    clock: Arc<dyn Clock>,
    tracker: Arc<DirtyTracker>,
    registry: Arc<SpawnerRegistry>,
    store: SpawnerStore,
    scheduler: Arc<WorkerScheduler>,
    generator: LootGenerator,
    checker: ActivationChecker,
    participants: Arc<dyn ParticipantSource>,
    economy: Arc<dyn Economy>,
}

impl SpawnerService {
    /// Builds the service and loads every stored spawner under `root`.
    pub fn start(
        root: &Path,
        settings: ServerSettings,
        loot: LootRegistry,
        participants: Arc<dyn ParticipantSource>,
        economy: Arc<dyn Economy>,
        clock: Arc<dyn Clock>,
        seed: u64,
    ) -> Self {
        let tracker = Arc::new(DirtyTracker::new());
        let prices: Arc<dyn PriceSource> = Arc::new(loot.items().price_table());
        let ctx = Arc::new(SpawnerContext {
            prices,
            changes: tracker.clone(),
            lock_timeout: settings.lock_timeout(),
        });
        let registry = Arc::new(SpawnerRegistry::new(Arc::clone(&ctx), settings.max_stack_size));
        let store = SpawnerStore::from_root(root);

        let report = store.load_all();
        for err in &report.errors {
            log::error!("spawner load: {}", err);
        }
        for record in report.records {
            let id = record.id;
            if let Err(err) = registry.insert(Spawner::from_record(record, Arc::clone(&ctx))) {
                log::error!("spawner {} not registered: {}", id, err);
            }
        }
        log::info!(
            "loaded {} spawners ({} files, {} errors)",
            registry.len(),
            report.files,
            report.errors.len()
        );

        let scheduler = WorkerScheduler::start(settings.background_workers);
        let dyn_scheduler: Arc<dyn TaskScheduler> = scheduler.clone();
        let generator = LootGenerator::new(
            Arc::new(loot),
            Arc::clone(&dyn_scheduler),
            Arc::clone(&clock),
            settings.pregeneration_threshold_ms,
            seed,
        );
        let checker = ActivationChecker::new(dyn_scheduler, Arc::clone(&clock));
        Self {
            settings,
            clock,
            tracker,
            registry,
            store,
            scheduler,
            generator,
            checker,
            participants,
            economy,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SpawnerRegistry> {
        &self.registry
    }

    pub fn pending_changes(&self) -> usize {
        self.tracker.pending_len()
    }

    pub fn place(
        &self,
        position: Position,
        kind: SpawnerKind,
        stack_size: u32,
    ) -> Result<Arc<Spawner>, RegistryError> {
        self.registry.place(
            position,
            kind,
            self.settings.defaults,
            stack_size,
            self.clock.now_ms(),
        )
    }

    pub fn view(&self, position: Position, page: usize) -> Result<SpawnerView, RegistryError> {
        let spawner = self.spawner_at(position)?;
        Ok(spawner.view(page, self.settings.page_size, self.clock.now_ms())?)
    }

    pub fn sell_all(
        &self,
        position: Position,
        seller: ParticipantId,
    ) -> Result<SaleReceipt, RegistryError> {
        let spawner = self.spawner_at(position)?;
        Ok(spawner.sell_all(self.economy.as_ref(), seller)?)
    }

    /// Pull for machinery sitting directly under a spawner. A busy or
    /// missing spawner yields nothing.
    pub fn siphon_into(&self, machinery: Position, max_slots: usize) -> Vec<ItemStack> {
        let Some(spawner) = machinery.above().and_then(|above| self.registry.at(above)) else {
            return Vec::new();
        };
        match spawner.siphon(max_slots) {
            Ok(stacks) => stacks,
            Err(SpawnerError::Busy(_)) => Vec::new(),
            Err(err) => {
                log::warn!("siphon from spawner {} failed: {}", spawner.id(), err);
                Vec::new()
            }
        }
    }

    fn spawner_at(&self, position: Position) -> Result<Arc<Spawner>, RegistryError> {
        self.registry
            .at(position)
            .ok_or(RegistryError::NotFound(position))
    }

    pub fn run_activation_cycle(&self) -> CycleReport {
        let spawners = self.registry.all();
        self.checker
            .run_cycle(&spawners, self.participants.as_ref(), &self.generator)
    }

    /// Simulation-thread step: applies batches and activation follow-ups
    /// that workers handed back.
    pub fn drain(&self, budget: usize) -> usize {
        self.scheduler.drain_simulation(budget)
    }

    pub fn flush(&self) -> FlushReport {
        let report = flush_dirty(&self.tracker, &self.registry, &self.store);
        for err in &report.errors {
            log::error!("spawner flush: {}", err);
        }
        report
    }

    pub fn sweep_locks(&self) -> usize {
        self.registry.sweep_locks()
    }

    /// Stops the workers, applies whatever they already handed back and
    /// writes every pending change.
    pub fn shutdown(&self) -> FlushReport {
        self.scheduler.shutdown();
        while self.drain(1_024) > 0 {}
        let report = self.flush();
        log::info!(
            "shutdown flush: saved={}, deleted={}, deferred={}",
            report.saved,
            report.deleted,
            report.deferred
        );
        report
    }
}

pub fn spawn_activation_loop(
    service: Arc<SpawnerService>,
    control: Arc<ServerControl>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let interval = service.settings().check_interval();
        let mut next_due = Instant::now();
        while control.is_running() {
            let now = Instant::now();
            if now >= next_due {
                let report = service.run_activation_cycle();
                if report.activated > 0 || report.deactivated > 0 {
                    log::debug!(
                        "activation cycle: checked={}, activated={}, deactivated={}, dispatched={}",
                        report.checked,
                        report.activated,
                        report.deactivated,
                        report.dispatched
                    );
                }
                next_due = now + interval;
            }
            let wait = next_due.saturating_duration_since(Instant::now());
            thread::sleep(wait.min(Duration::from_millis(250)));
        }
    })
}

pub fn spawn_flush_loop(
    service: Arc<SpawnerService>,
    control: Arc<ServerControl>,
) -> Option<thread::JoinHandle<()>> {
    let interval = service.settings().flush_interval_secs;
    if interval == 0 {
        log::info!("periodic flush disabled");
        return None;
    }
    log::info!("periodic flush enabled: interval={}s", interval);
    Some(thread::spawn(move || {
        let mut state = AutosaveState::new(
            AutosaveConfig {
                interval_seconds: interval,
            },
            Instant::now(),
        );
        while control.is_running() {
            let now = Instant::now();
            if state.due(now) {
                let report = service.flush();
                if report.saved > 0 || report.deleted > 0 {
                    log::info!(
                        "flush completed (saved: {}, deleted: {}, deferred: {})",
                        report.saved,
                        report.deleted,
                        report.deferred
                    );
                }
                state.mark_saved(now);
            }
            thread::sleep(Duration::from_millis(250));
        }
    }))
}

pub fn spawn_lock_sweep_loop(
    service: Arc<SpawnerService>,
    control: Arc<ServerControl>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let interval = service.settings().lock_sweep_interval();
        let mut next_due = Instant::now() + interval;
        while control.is_running() {
            let now = Instant::now();
            if now >= next_due {
                let removed = service.sweep_locks();
                if removed > 0 {
                    log::debug!("lock sweep removed {} idle position locks", removed);
                }
                next_due = now + interval;
            }
            thread::sleep(Duration::from_millis(250));
        }
    })
}
