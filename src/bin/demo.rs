//! demo - end-to-end synthetic run
//!
//! Drives the full pipeline with a synthetic `stub://` lot, the stub
//! detector (which misses vehicles at random) and an in-memory sink, then
//! prints every record row that was written. No camera, model or network
//! needed.

use anyhow::{anyhow, Result};
use chrono::Local;
use clap::Parser;
use std::io::IsTerminal;
use std::time::Duration;

use parking_occupancy::ingest::synthetic::SyntheticConfig;
use parking_occupancy::{
    AdapterConfig, BBox, Cadence, DetectorAdapter, ManualClock, MemorySink, ParkingSlot,
    Pipeline, PipelineSettings, SheetLayout, StopSignal, StubBackend, SyntheticSource,
};

#[path = "../ui.rs"]
mod ui;

const LOT_COLUMNS: u32 = 4;
const SLOT_SIZE: f64 = 100.0;
const SLOT_GAP: f64 = 20.0;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of synthetic frames (one per sampling interval).
    #[arg(long, default_value_t = 60)]
    frames: u64,
    /// Parked vehicles in the 16-slot lot.
    #[arg(long, default_value_t = 9)]
    parked: usize,
    /// Probability that the stub detector misses a vehicle in a frame.
    #[arg(long, default_value_t = 0.15)]
    miss_rate: f64,
    /// Sampling interval in (simulated) seconds.
    #[arg(long, default_value_t = 2.0)]
    interval: f64,
    /// Minimum seconds between sink writes.
    #[arg(long, default_value_t = 30.0)]
    min_update: f64,
    /// Deterministic seed for detector misses.
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let lot = lot_boxes()?;
    if args.parked > lot.len() {
        return Err(anyhow!("--parked must be at most {}", lot.len()));
    }
    // Parked cars sit inside their slot with a small margin.
    let vehicles: Vec<[f32; 4]> = lot
        .iter()
        .take(args.parked)
        .map(|b| {
            [
                (b.x1 + 10.0) as f32,
                (b.y1 + 10.0) as f32,
                (b.x2 - 10.0) as f32,
                (b.y2 - 10.0) as f32,
            ]
        })
        .collect();
    let slots: Vec<ParkingSlot> = lot
        .into_iter()
        .zip(1u32..)
        .map(|(bbox, id)| ParkingSlot::with_box(id, bbox))
        .collect();

    let interval = Duration::try_from_secs_f64(args.interval)
        .map_err(|_| anyhow!("--interval must be a non-negative number of seconds"))?;
    let min_update = Duration::try_from_secs_f64(args.min_update)
        .map_err(|_| anyhow!("--min-update must be a non-negative number of seconds"))?;
    let fps = 1.0 / args.interval.max(1e-3);

    let sink = MemorySink::new();
    let mut pipeline = {
        let _stage = ui.stage("Build pipeline");
        let source = SyntheticSource::new(
            "stub://demo_lot",
            SyntheticConfig {
                width: 520,
                height: 520,
                fps,
                frames: Some(args.frames),
            },
        );
        let backend = StubBackend::new(vehicles, args.miss_rate, args.seed);
        let adapter = DetectorAdapter::new(Box::new(backend), AdapterConfig::default())?;
        let settings = PipelineSettings {
            cadence: Cadence::FrameCount { interval },
            cycle_pause: interval,
            loop_on_eos: false,
            update_min_interval: min_update,
            ..PipelineSettings::default()
        };
        Pipeline::new(
            Box::new(source),
            adapter,
            Box::new(sink.clone()),
            settings,
            StopSignal::new(),
        )
        .with_layout(SheetLayout::new("5", "Demo lot"))
        .with_clock(Box::new(ManualClock::new(Local::now())))
        .with_slots(slots)?
    };

    let summary = {
        let _stage = ui.stage("Run pipeline");
        pipeline.run()?
    };

    if let Some(estimate) = summary.last_estimate {
        let gauge = ui.occupancy(estimate.total_slots());
        gauge.update(estimate.occupied_count, estimate.free_count);
        gauge.finish();
    }

    println!(
        "demo: {} frames, {} cycles, {} writes ({} skipped)",
        summary.stats.frames_read,
        summary.stats.cycles,
        summary.stats.writes,
        summary.stats.skipped_writes
    );
    println!("record rows:");
    for row in sink.rows() {
        println!("  {}", row.join(" | "));
    }
    let (appends, updates) = sink.write_counts();
    println!("sink operations: {} appends, {} cell updates", appends, updates);
    Ok(())
}

/// A 4x4 lot of square slots in row-major order.
fn lot_boxes() -> Result<Vec<BBox>> {
    (0..LOT_COLUMNS * LOT_COLUMNS)
        .map(|i| {
            let col = (i % LOT_COLUMNS) as f64;
            let row = (i / LOT_COLUMNS) as f64;
            let x1 = SLOT_GAP + col * (SLOT_SIZE + SLOT_GAP);
            let y1 = SLOT_GAP + row * (SLOT_SIZE + SLOT_GAP);
            BBox::new(x1, y1, x1 + SLOT_SIZE, y1 + SLOT_SIZE)
        })
        .collect()
}
