//! parkingd - parking occupancy daemon
//!
//! This daemon:
//! 1. Loads configuration (file + PARKING_* environment overrides)
//! 2. Opens the frame source and the detector backend
//! 3. Samples frames on the configured cadence and estimates free slots
//! 4. Writes the free-slot count to the record sink when it changes
//!
//! Ctrl-C raises the stop signal; the current cycle finishes (without issuing
//! a new write) and the daemon exits with a run summary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use parking_occupancy::{ParkingConfig, Pipeline, StopReason, StopSignal};

#[derive(Parser, Debug)]
#[command(name = "parkingd", version, about = "Parking occupancy daemon")]
struct Args {
    /// Path to the configuration file (.json or .toml)
    #[arg(long, env = "PARKING_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = ParkingConfig::load(args.config.as_deref()).map_err(|e| {
        log::error!("{}", e);
        e
    })?;
    log::info!(
        "parkingd {} starting: source={} backend={:?} sink={:?} interval={:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.source,
        cfg.detector.backend,
        cfg.sink.kind,
        cfg.frame_interval
    );

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, finishing current cycle...");
        handler_stop.stop();
    })?;

    let mut pipeline = Pipeline::from_config(&cfg, stop)?;
    let summary = pipeline.run()?;

    match summary.reason {
        StopReason::SourceExhausted => log::info!("source exhausted"),
        StopReason::RunTimeout => log::info!("run timeout reached"),
        StopReason::StopRequested => log::info!("stopped on request"),
    }
    log::info!(
        "source {}: {} frames decoded, {} rewinds",
        summary.source.uri,
        summary.source.frames_read,
        summary.source.rewinds
    );
    if let Some(estimate) = summary.last_estimate {
        log::info!(
            "last estimate: {} free / {} total",
            estimate.free_count,
            estimate.total_slots()
        );
    }
    Ok(())
}
