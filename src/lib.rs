mod config;
pub mod entities;
pub mod persistence;
mod server;
pub mod telemetry;
pub mod world;

pub use config::{AppConfig, ConfigError, ServerSettings};
pub use server::{
    spawn_activation_loop, spawn_flush_loop, spawn_lock_sweep_loop, ServerControl, SpawnerService,
};

use std::sync::Arc;
use world::economy::{Economy, Ledger};
use world::item_types::ItemTypeIndex;
use world::loot::LootRegistry;
use world::participants::{ParticipantList, ParticipantSnapshot};
use world::time::{Clock, SystemClock};

/// Simulation steps drained per tick before yielding.
const DRAIN_BUDGET: usize = 256;

pub fn run(args: &[String]) -> Result<(), String> {
    let config = config::AppConfig::from_args(args).map_err(|err| err.to_string())?;
    telemetry::logging::init(&config.root)?;
    let settings = config::ServerSettings::load(&config.root).map_err(|err| err.to_string())?;
    let items =
        ItemTypeIndex::load(&config.root.join("items.yml")).map_err(|err| err.to_string())?;
    let loot = LootRegistry::load(&config.root.join("loot.yml"), items)
        .map_err(|err| err.to_string())?;
    let snapshots: Vec<ParticipantSnapshot> =
        config::read_yaml_or_default(&config.root.join("participants.yml"))
            .map_err(|err| err.to_string())?;

    println!("spawnstack: data root {}", config.root.display());
    println!("- item types: {}", loot.items().len());
    println!("- loot tables: {}", loot.len());
    println!("- participants: {}", snapshots.len());

    let economy: Arc<dyn Economy> = Arc::new(Ledger::new(loot.items().price_table()));
    let participants = Arc::new(ParticipantList::new(snapshots));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let seed = clock.now_ms();
    let service = Arc::new(SpawnerService::start(
        &config.root,
        settings,
        loot,
        participants,
        economy,
        clock,
        seed,
    ));
    println!("- spawners: {}", service.registry().len());

    let control = Arc::new(ServerControl::new());
    let activation_handle = spawn_activation_loop(Arc::clone(&service), Arc::clone(&control));
    let flush_handle = spawn_flush_loop(Arc::clone(&service), Arc::clone(&control));
    let sweep_handle = spawn_lock_sweep_loop(Arc::clone(&service), Arc::clone(&control));

    let stop_file = config.root.join("shutdown");
    let mut tick: u64 = 0;
    while control.is_running() {
        service.drain(DRAIN_BUDGET);
        tick += 1;
        if config.ticks.map_or(false, |max| tick >= max) {
            control.request_shutdown();
            break;
        }
        if stop_file.exists() {
            let _ = std::fs::remove_file(&stop_file);
            log::info!("shutdown requested through {}", stop_file.display());
            control.request_shutdown();
            break;
        }
        std::thread::sleep(config.tick_length);
    }

    for (name, handle) in [
        ("activation", Some(activation_handle)),
        ("flush", flush_handle),
        ("lock sweep", Some(sweep_handle)),
    ] {
        if let Some(handle) = handle {
            if handle.join().is_err() {
                eprintln!("{} loop thread panicked", name);
            }
        }
    }

    let report = service.shutdown();
    println!(
        "spawnstack: stopped after {} ticks (saved: {}, deleted: {}, deferred: {}, errors: {})",
        tick,
        report.saved,
        report.deleted,
        report.deferred,
        report.errors.len()
    );
    log::logger().flush();
    Ok(())
}
