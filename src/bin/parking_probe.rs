//! parking_probe - one-shot occupancy check
//!
//! Loads the same configuration as parkingd, grabs a single frame, runs
//! detection and slot mapping, and prints the snapshot as JSON on stdout.
//! Never writes to the record sink. Useful when tuning slots, ROI files and
//! confidence thresholds against a live camera.

use anyhow::{anyhow, Result};
use chrono::Local;
use clap::Parser;
use serde_json::json;
use std::io::IsTerminal;
use std::path::PathBuf;

use parking_occupancy::pipeline::detector_from_config;
use parking_occupancy::{open_source, FrameRead, OccupancyMapper, ParkingConfig, SmoothedEstimate};

#[path = "../ui.rs"]
mod ui;

/// Reads attempted before giving up on a flaky source.
const MAX_READ_ATTEMPTS: u32 = 10;

#[derive(Parser, Debug)]
#[command(
    name = "parking_probe",
    about = "Detect vehicles in one frame and print the occupancy snapshot"
)]
struct Args {
    /// Path to the configuration file (.json or .toml)
    #[arg(long, env = "PARKING_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured source
    #[arg(long)]
    source: Option<String>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = {
        let _stage = ui.stage("Load configuration");
        ParkingConfig::load(args.config.as_deref())?
    };
    if let Some(source) = args.source {
        cfg.source = source;
    }

    let mut adapter = {
        let _stage = ui.stage("Load detector");
        detector_from_config(&cfg)?
    };

    let frame = {
        let _stage = ui.stage("Grab frame");
        let mut source = open_source(&cfg.source)?;
        source.open()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match source.read() {
                FrameRead::Frame(frame) => break frame,
                FrameRead::EndOfStream => return Err(anyhow!("{} has no frames", cfg.source)),
                FrameRead::Failed(reason) if attempt < MAX_READ_ATTEMPTS => {
                    log::warn!("read attempt {} failed: {}", attempt, reason);
                    std::thread::sleep(cfg.sampling.read_retry);
                }
                FrameRead::Failed(reason) => {
                    return Err(anyhow!("no frame after {} attempts: {}", attempt, reason))
                }
            }
        }
    };
    let (width, height) = (frame.width, frame.height);

    let detections = {
        let _stage = ui.stage("Detect vehicles");
        adapter.detect(frame)?
    };

    let now = Local::now();
    let (occupied_ids, raw_count, total) = if cfg.parking_slots.is_empty() {
        (Vec::new(), detections.len(), cfg.total_slots)
    } else {
        let mapper = OccupancyMapper::new(cfg.parking_slots.clone())?;
        let snapshot = mapper.map(&detections, now);
        (
            snapshot.occupied_slot_ids.iter().copied().collect(),
            snapshot.occupied_count(),
            snapshot.total_slots,
        )
    };
    let estimate = SmoothedEstimate::from_counts(raw_count, total);
    let gauge = ui.occupancy(total);
    gauge.update(estimate.occupied_count, estimate.free_count);
    gauge.finish();

    let report = json!({
        "source": cfg.source,
        "frame": { "width": width, "height": height },
        "timestamp": now.format(parking_occupancy::sink::TIMESTAMP_FORMAT).to_string(),
        "detections": detections.iter().map(|d| json!({
            "class_id": d.class_id,
            "class_name": d.class_name,
            "confidence": d.confidence,
            "bbox": [d.bbox.x1, d.bbox.y1, d.bbox.x2, d.bbox.y2],
        })).collect::<Vec<_>>(),
        "occupied_slot_ids": occupied_ids,
        "occupied": estimate.occupied_count,
        "free": estimate.free_count,
        "total": total,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
