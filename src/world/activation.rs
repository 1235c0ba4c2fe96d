use crate::world::loot::{LootGenerator, TickOutcome};
use crate::world::participants::{ParticipantSnapshot, ParticipantSource};
use crate::world::position::{Position, WorldId};
use crate::world::scheduler::TaskScheduler;
use crate::world::spawner::Spawner;
use crate::world::time::Clock;
use std::collections::HashMap;
use std::sync::Arc;

/// Eligible participant positions grouped by world.
#[derive(Debug, Default, Clone)]
pub struct ParticipantIndex {
    by_world: HashMap<WorldId, Vec<Position>>,
}

impl ParticipantIndex {
    pub fn build(participants: &[ParticipantSnapshot]) -> Self {
        let mut by_world: HashMap<WorldId, Vec<Position>> = HashMap::new();
        for participant in participants.iter().filter(|p| p.eligible) {
            by_world
                .entry(participant.position.world)
                .or_default()
                .push(participant.position);
        }
        Self { by_world }
    }

    pub fn any_within(&self, position: Position, range: u32) -> bool {
        self.by_world
            .get(&position.world)
            .map_or(false, |positions| {
                positions.iter().any(|other| position.within(*other, range))
            })
    }

    pub fn len(&self) -> usize {
        self.by_world.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_world.is_empty()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub activated: usize,
    pub deactivated: usize,
    pub ticked: usize,
    pub dispatched: usize,
}

/// Decides once per interval which spawners should run. The distance pass
/// runs on the caller's thread; the follow-up of each flip is handed to
/// the spawner's region.
pub struct ActivationChecker {
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
}

impl ActivationChecker {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, clock: Arc<dyn Clock>) -> Self {
        Self { scheduler, clock }
    }

    pub fn run_cycle(
        &self,
        spawners: &[Arc<Spawner>],
        participants: &dyn ParticipantSource,
        generator: &LootGenerator,
    ) -> CycleReport {
        let index = ParticipantIndex::build(&participants.snapshot());
        let mut report = CycleReport::default();
        for spawner in spawners {
            if spawner.is_removed() {
                continue;
            }
            report.checked += 1;
            let in_range = index.any_within(spawner.position(), spawner.range());
            match spawner.update_proximity(in_range) {
                Some(active) => {
                    if active {
                        report.activated += 1;
                    } else {
                        report.deactivated += 1;
                    }
                    log::debug!(
                        "spawner {} {}",
                        spawner.id(),
                        if active { "activated" } else { "deactivated" }
                    );
                    self.schedule_transition(spawner);
                }
                None if spawner.is_active() => {
                    report.ticked += 1;
                    if matches!(
                        generator.tick(spawner),
                        TickOutcome::Dispatched | TickOutcome::DispatchedCached
                    ) {
                        report.dispatched += 1;
                    }
                }
                None => {}
            }
        }
        report
    }

    fn schedule_transition(&self, spawner: &Arc<Spawner>) {
        let spawner = Arc::clone(spawner);
        let clock = Arc::clone(&self.clock);
        let position = spawner.position();
        self.scheduler.run_at(
            position,
            Box::new(move || {
                spawner.complete_transition(clock.now_ms());
            }),
        );
    }
}
