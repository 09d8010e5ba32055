//! Mnemo maintenance binary.
//!
//! Loads a snapshot into a fresh engine, runs one operation and prints the
//! result as JSON:
//! 1. Resolve and load configuration
//! 2. Install logging
//! 3. Align the engine's dimension and metric with the snapshot header
//! 4. Run the subcommand

mod cli;

use std::path::Path;

use clap::Parser;
use tracing::info;

use mnemo_cache::{CacheOptions, TieredCache};
use mnemo_core::config::MnemoConfig;
use mnemo_engine::MemoryEngine;
use mnemo_store::Snapshot;

use cli::{CliArgs, Command};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_path = args.resolve_config_path();
    let config = MnemoConfig::load_or_default(&config_path);
    mnemo_core::logging::init(&args.resolve_log_level(&config.general.log_level));
    info!(path = %config_path.display(), "Starting mnemo v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Stats { snapshot } => {
            let engine = load_engine(&config, &snapshot)?;
            let stats = engine.stats();
            eprintln!("{}", stats.summary());
            print_json(&stats)?;
        }
        Command::Consolidate {
            snapshot,
            output,
            dry_run,
        } => {
            let engine = load_engine(&config, &snapshot)?;
            let report = engine.consolidate()?;
            print_json(&report)?;
            if !dry_run && report.is_completed() {
                let target = output.unwrap_or(snapshot);
                engine.export_to_path(&target)?;
                info!(path = %target.display(), "Consolidated snapshot written");
            }
        }
        Command::Decay {
            snapshot,
            half_life_days,
            output,
        } => {
            let engine = load_engine(&config, &snapshot)?;
            let report = engine.apply_decay(half_life_days)?;
            print_json(&report)?;
            let target = output.unwrap_or(snapshot);
            engine.export_to_path(&target)?;
        }
        Command::Query {
            snapshot,
            vector,
            k,
            mode,
        } => {
            let engine = load_engine(&config, &snapshot)?;
            let results = match mode {
                Some(mode) => engine.query_with_mode(&vector, k, mode)?,
                None => engine.query(&vector, k)?,
            };
            print_json(&results)?;
        }
        Command::CacheSweep { dir } => {
            let options = CacheOptions::from_config(&config.cache, Path::new("."))
                .with_disk(dir.clone());
            let cache: TieredCache<serde_json::Value> = TieredCache::new(options);
            let removed = cache.cleanup_expired();
            info!(dir = %dir.display(), removed, "Cache sweep finished");
            print_json(&serde_json::json!({
                "dir": dir,
                "removed": removed,
                "degraded": cache.stats().degraded,
            }))?;
        }
    }
    Ok(())
}

/// Build an engine matching the snapshot's header and import it.
fn load_engine(config: &MnemoConfig, path: &Path) -> Result<MemoryEngine, Box<dyn std::error::Error>> {
    let snapshot = Snapshot::read_from_path(path)?;
    let mut config = config.clone();
    config.vector.dimension = snapshot.dimension;
    config.vector.metric = snapshot.metric;
    // Maintenance runs never touch the persistent cache.
    config.cache.persist = false;

    let engine = MemoryEngine::new(config)?;
    engine.import_snapshot(&snapshot)?;
    Ok(engine)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
