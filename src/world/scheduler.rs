use crate::world::position::{Position, RegionCoord};
use crossbeam::channel::{self, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where work runs. Background work must not touch world state; anything
/// that does goes through [`TaskScheduler::run_at`], which runs it on the
/// thread that owns the region of `position`.
pub trait TaskScheduler: Send + Sync {
    fn run_background(&self, task: Task);

    fn run_at(&self, position: Position, task: Task);
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn run_background(&self, task: Task) {
        task();
    }

    fn run_at(&self, _position: Position, task: Task) {
        task();
    }
}

/// A fixed pool of background workers plus a queue the simulation thread
/// drains once per tick.
pub struct WorkerScheduler {
    background: Mutex<Option<Sender<Task>>>,
    simulation_tx: Sender<(RegionCoord, Task)>,
    simulation_rx: Receiver<(RegionCoord, Task)>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerScheduler {
    pub fn start(workers: usize) -> Arc<Self> {
        let (background_tx, background_rx) = channel::unbounded::<Task>();
        let (simulation_tx, simulation_rx) = channel::unbounded();
        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let rx = background_rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("spawnstack-worker-{}", index))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        run_guarded(task);
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => log::error!("failed to start worker {}: {}", index, err),
            }
        }
        Arc::new(Self {
            background: Mutex::new(Some(background_tx)),
            simulation_tx,
            simulation_rx,
            workers: Mutex::new(handles),
        })
    }

    /// Runs up to `budget` queued simulation tasks on the calling thread.
    pub fn drain_simulation(&self, budget: usize) -> usize {
        let mut ran = 0;
        while ran < budget {
            match self.simulation_rx.try_recv() {
                Ok((_region, task)) => {
                    run_guarded(task);
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    pub fn pending_simulation(&self) -> usize {
        self.simulation_rx.len()
    }

    /// Stops accepting background work and waits for workers to finish
    /// what they already took.
    pub fn shutdown(&self) {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl TaskScheduler for WorkerScheduler {
    fn run_background(&self, task: Task) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match background.as_ref() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    log::warn!("background queue closed; task dropped");
                }
            }
            None => log::debug!("scheduler shut down; background task dropped"),
        }
    }

    fn run_at(&self, position: Position, task: Task) {
        if self.simulation_tx.send((position.region(), task)).is_err() {
            log::warn!("simulation queue closed; task dropped");
        }
    }
}

fn run_guarded(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        log::error!("scheduled task panicked");
    }
}
