use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{Local, TimeZone};

use parking_occupancy::{
    AdapterConfig, BBox, Cadence, DetectRequest, DetectorAdapter, DetectorBackend, Frame,
    FrameRead, FrameSource, ManualClock, MemorySink, ParkingSlot, Pipeline, PipelineError,
    PipelineSettings, RawDetection, SourceStats, StopReason, StopSignal,
};

#[derive(Clone, Copy, Debug)]
enum Step {
    Frame,
    Fail,
    End,
}

/// Plays back a fixed script of reads. Past the end of the script every read
/// is end-of-stream.
struct ScriptedSource {
    steps: Vec<Step>,
    pos: usize,
    finite: bool,
    opens_allowed: usize,
    opens: usize,
    stop_on_frame: Option<(usize, StopSignal)>,
    stats: SourceStats,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>, finite: bool) -> Self {
        Self {
            steps,
            pos: 0,
            finite,
            opens_allowed: usize::MAX,
            opens: 0,
            stop_on_frame: None,
            stats: SourceStats {
                uri: "scripted://lot".to_string(),
                ..SourceStats::default()
            },
        }
    }

    fn frames(n: usize) -> Self {
        Self::new(vec![Step::Frame; n], true)
    }
}

impl FrameSource for ScriptedSource {
    fn uri(&self) -> &str {
        "scripted://lot"
    }

    fn open(&mut self) -> Result<(), PipelineError> {
        if self.opens >= self.opens_allowed {
            return Err(PipelineError::source_open(self.uri(), "camera unreachable"));
        }
        self.opens += 1;
        Ok(())
    }

    fn read(&mut self) -> FrameRead {
        let step = self.steps.get(self.pos).copied().unwrap_or(Step::End);
        if !matches!(step, Step::End) {
            self.pos += 1;
        }
        match step {
            Step::Frame => {
                self.stats.frames_read += 1;
                if let Some((on_frame, stop)) = &self.stop_on_frame {
                    if self.stats.frames_read as usize == *on_frame {
                        stop.stop();
                    }
                }
                let frame = Frame::new(vec![80u8; 32 * 32 * 3], 32, 32, self.pos as u64)
                    .expect("valid frame");
                FrameRead::Frame(frame)
            }
            Step::Fail => FrameRead::Failed("grab timeout".to_string()),
            Step::End => FrameRead::EndOfStream,
        }
    }

    fn fps(&self) -> Option<f64> {
        Some(1.0)
    }

    fn is_finite(&self) -> bool {
        self.finite
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        self.pos = 0;
        self.stats.rewinds += 1;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

/// Answers each call from a script of vehicle boxes (or an error). The last
/// entry repeats once the script runs out.
struct ScriptedBackend {
    responses: Vec<Result<Vec<[f32; 4]>, String>>,
    calls: usize,
    advance_on_call: Option<(usize, ManualClock, Duration)>,
}

impl ScriptedBackend {
    fn new(responses: Vec<Result<Vec<[f32; 4]>, String>>) -> Self {
        Self {
            responses,
            calls: 0,
            advance_on_call: None,
        }
    }

    fn counts(counts: &[usize]) -> Self {
        Self::new(counts.iter().map(|n| Ok(vehicles(*n))).collect())
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame, _request: &DetectRequest) -> Result<Vec<RawDetection>> {
        self.calls += 1;
        let call = self.calls;
        if let Some((on_call, clock, by)) = &self.advance_on_call {
            if call == *on_call {
                clock.advance(*by);
            }
        }
        let response = self
            .responses
            .get(call - 1)
            .or_else(|| self.responses.last())
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()));
        let boxes = response.map_err(|e| anyhow!(e))?;
        Ok(boxes
            .into_iter()
            .map(|bbox| RawDetection {
                class_id: 2,
                class_name: None,
                confidence: 0.9,
                bbox,
            })
            .collect())
    }
}

/// Takes `delay` of real time per call, then reports one vehicle.
struct SlowBackend {
    delay: Duration,
}

impl DetectorBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn detect(&mut self, _frame: &Frame, _request: &DetectRequest) -> Result<Vec<RawDetection>> {
        thread::sleep(self.delay);
        Ok(vec![RawDetection {
            class_id: 2,
            class_name: None,
            confidence: 0.9,
            bbox: vehicles(1)[0],
        }])
    }
}

/// `n` non-overlapping vehicle boxes in a row.
fn vehicles(n: usize) -> Vec<[f32; 4]> {
    (0..n)
        .map(|i| {
            let x = i as f32 * 100.0;
            [x, 300.0, x + 40.0, 340.0]
        })
        .collect()
}

/// 16 slots in a 4x4 grid of 50px cells with 10px gaps; slot 1 is (0,0)-(50,50).
fn sixteen_slots() -> Vec<ParkingSlot> {
    (0..16u32)
        .map(|i| {
            let x = (i % 4) as f64 * 60.0;
            let y = (i / 4) as f64 * 60.0;
            ParkingSlot::with_box(i + 1, BBox::new(x, y, x + 50.0, y + 50.0).unwrap())
        })
        .collect()
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        cadence: Cadence::FrameCount {
            interval: Duration::from_secs(1),
        },
        cycle_pause: Duration::from_secs(1),
        read_retry_pause: Duration::from_millis(200),
        loop_on_eos: false,
        eos_pause: Duration::from_secs(1),
        max_reconnect_attempts: 2,
        run_timeout: Some(Duration::from_secs(600)),
        fallback_total_slots: 16,
        smoothing_window: 9,
        update_min_interval: Duration::ZERO,
    }
}

fn clock() -> ManualClock {
    ManualClock::new(Local.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())
}

fn pipeline(
    source: ScriptedSource,
    backend: ScriptedBackend,
    sink: &MemorySink,
    settings: PipelineSettings,
    stop: StopSignal,
) -> Pipeline {
    pipeline_on(clock(), source, Box::new(backend), sink, settings, stop)
}

fn pipeline_on(
    clock: ManualClock,
    source: ScriptedSource,
    backend: Box<dyn DetectorBackend>,
    sink: &MemorySink,
    settings: PipelineSettings,
    stop: StopSignal,
) -> Pipeline {
    real_time_pipeline(source, backend, sink, settings, stop).with_clock(Box::new(clock))
}

/// Runs on the system clock.
fn real_time_pipeline(
    source: ScriptedSource,
    backend: Box<dyn DetectorBackend>,
    sink: &MemorySink,
    settings: PipelineSettings,
    stop: StopSignal,
) -> Pipeline {
    let adapter = DetectorAdapter::new(backend, AdapterConfig::default()).unwrap();
    Pipeline::new(
        Box::new(source),
        adapter,
        Box::new(sink.clone()),
        settings,
        stop,
    )
}

#[test]
fn single_vehicle_in_sixteen_slot_lot_reports_fifteen_free() {
    let sink = MemorySink::new();
    let backend = ScriptedBackend::new(vec![Ok(vec![[10.0, 10.0, 40.0, 40.0]])]);
    let mut pipeline = pipeline(
        ScriptedSource::frames(3),
        backend,
        &sink,
        settings(),
        StopSignal::new(),
    )
    .with_slots(sixteen_slots())
    .unwrap();

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.reason, StopReason::SourceExhausted);
    assert_eq!(summary.stats.cycles, 3);
    assert_eq!(summary.source.frames_read, 3);
    assert_eq!(summary.source.uri, "scripted://lot");
    assert_eq!(summary.stats.writes, 1);
    assert_eq!(summary.stats.skipped_writes, 2);
    let estimate = summary.last_estimate.unwrap();
    assert_eq!((estimate.free_count, estimate.occupied_count), (15, 1));
    assert_eq!(
        sink.rows(),
        vec![vec!["5", "", "", "15", "16", "", "", "2024-05-01 08:00:00"]]
    );
}

#[test]
fn raw_count_fallback_without_slots() {
    let sink = MemorySink::new();
    let mut pipeline = pipeline(
        ScriptedSource::frames(4),
        ScriptedBackend::counts(&[7]),
        &sink,
        settings(),
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    let estimate = summary.last_estimate.unwrap();
    assert_eq!(estimate.occupied_count, 7);
    assert_eq!(estimate.free_count, 16 - 7);
    assert_eq!(sink.rows()[0][3], "9");
    assert_eq!(sink.rows()[0][4], "16");
}

#[test]
fn median_window_suppresses_a_single_frame_spike() {
    let sink = MemorySink::new();
    let mut pipeline = pipeline(
        ScriptedSource::frames(9),
        ScriptedBackend::counts(&[3, 10, 4, 4, 4, 4, 4, 4, 4]),
        &sink,
        settings(),
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.stats.cycles, 9);
    assert_eq!(summary.last_estimate.unwrap().occupied_count, 4);
    assert_eq!(sink.rows()[0][3], "12");
}

#[test]
fn detection_failure_skips_smoothing_and_gate() {
    let sink = MemorySink::new();
    let backend = ScriptedBackend::new(vec![
        Ok(vehicles(2)),
        Err("inference exploded".to_string()),
        Ok(vehicles(2)),
    ]);
    let mut pipeline = pipeline(
        ScriptedSource::frames(3),
        backend,
        &sink,
        settings(),
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.stats.detection_failures, 1);
    assert_eq!(summary.stats.cycles, 2);
    assert_eq!(summary.stats.writes, 1);
    assert_eq!(summary.stats.skipped_writes, 1);
    assert_eq!(summary.last_estimate.unwrap().free_count, 14);
}

#[test]
fn transient_read_failures_are_retried() {
    let sink = MemorySink::new();
    let source = ScriptedSource::new(
        vec![Step::Frame, Step::Fail, Step::Fail, Step::Frame],
        true,
    );
    let mut pipeline = pipeline(
        source,
        ScriptedBackend::counts(&[1]),
        &sink,
        settings(),
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.reason, StopReason::SourceExhausted);
    assert_eq!(summary.stats.read_failures, 2);
    assert_eq!(summary.stats.cycles, 2);
}

#[test]
fn finite_source_loops_until_run_timeout() {
    let sink = MemorySink::new();
    let mut run_settings = settings();
    run_settings.loop_on_eos = true;
    run_settings.run_timeout = Some(Duration::from_secs(10));
    let mut pipeline = pipeline(
        ScriptedSource::frames(2),
        ScriptedBackend::counts(&[3]),
        &sink,
        run_settings,
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.reason, StopReason::RunTimeout);
    assert!(summary.stats.rewinds >= 2, "{:?}", summary.stats);
    assert_eq!(summary.source.rewinds, summary.stats.rewinds);
    assert!(summary.stats.cycles > 2);
    assert_eq!(summary.stats.writes, 1);
}

#[test]
fn live_source_that_cannot_reconnect_fails_the_run() {
    let sink = MemorySink::new();
    let mut source = ScriptedSource::new(vec![Step::Frame, Step::End], false);
    source.opens_allowed = 1;
    let mut pipeline = pipeline(
        source,
        ScriptedBackend::counts(&[1]),
        &sink,
        settings(),
        StopSignal::new(),
    );

    let err = pipeline.run().unwrap_err();

    assert!(matches!(err, PipelineError::SourceOpen { .. }));
    assert!(err.is_run_fatal());
    // The cycle before the drop was still reported.
    assert_eq!(sink.rows().len(), 1);
}

#[test]
fn unopenable_source_is_fatal_before_any_frame() {
    let sink = MemorySink::new();
    let mut source = ScriptedSource::frames(3);
    source.opens_allowed = 0;
    let mut pipeline = pipeline(
        source,
        ScriptedBackend::counts(&[1]),
        &sink,
        settings(),
        StopSignal::new(),
    );

    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, PipelineError::SourceOpen { .. }));
    assert!(sink.rows().is_empty());
}

#[test]
fn stop_signal_abandons_the_cycle_in_progress() {
    let sink = MemorySink::new();
    let stop = StopSignal::new();
    let mut source = ScriptedSource::frames(5);
    source.stop_on_frame = Some((2, stop.clone()));
    let mut run_settings = settings();
    run_settings.smoothing_window = 1;
    let mut pipeline = pipeline(
        source,
        ScriptedBackend::counts(&[2, 5]),
        &sink,
        run_settings,
        stop,
    );

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.reason, StopReason::StopRequested);
    assert_eq!(summary.stats.cycles, 1);
    assert_eq!(summary.stats.detection_failures, 0);
    assert_eq!(summary.stats.writes, 1);
    assert_eq!(sink.rows()[0][3], "14");
}

#[test]
fn run_timeout_during_detection_blocks_the_pending_write() {
    let sink = MemorySink::new();
    let clock = clock();
    let mut backend = ScriptedBackend::counts(&[2, 5]);
    // The second detection finishes long after the run deadline.
    backend.advance_on_call = Some((2, clock.clone(), Duration::from_secs(10)));
    let mut run_settings = settings();
    run_settings.smoothing_window = 1;
    run_settings.run_timeout = Some(Duration::from_secs(5));
    let mut pipeline = pipeline_on(
        clock,
        ScriptedSource::frames(5),
        Box::new(backend),
        &sink,
        run_settings,
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.reason, StopReason::RunTimeout);
    assert_eq!(summary.stats.cycles, 2);
    assert_eq!(summary.stats.writes, 1);
    assert_eq!(summary.last_estimate.unwrap().free_count, 11);
    assert_eq!(sink.write_counts(), (1, 0));
    assert_eq!(sink.rows()[0][3], "14");
}

#[test]
fn stop_signal_interrupts_a_slow_detector() {
    let sink = MemorySink::new();
    let stop = StopSignal::new();
    let mut run_settings = settings();
    run_settings.run_timeout = None;
    let mut pipeline = real_time_pipeline(
        ScriptedSource::new(vec![Step::Frame; 100], false),
        Box::new(SlowBackend {
            delay: Duration::from_secs(3),
        }),
        &sink,
        run_settings,
        stop.clone(),
    );
    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        stop.stop();
    });

    let started = Instant::now();
    let summary = pipeline.run().unwrap();
    raiser.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert_eq!(summary.reason, StopReason::StopRequested);
    assert_eq!(summary.stats.cycles, 0);
    assert_eq!(sink.write_counts(), (0, 0));
}

#[test]
fn run_timeout_interrupts_a_slow_detector_without_writing() {
    let sink = MemorySink::new();
    let mut run_settings = settings();
    run_settings.run_timeout = Some(Duration::from_millis(200));
    let mut pipeline = real_time_pipeline(
        ScriptedSource::new(vec![Step::Frame; 100], false),
        Box::new(SlowBackend {
            delay: Duration::from_secs(3),
        }),
        &sink,
        run_settings,
        StopSignal::new(),
    );

    let started = Instant::now();
    let summary = pipeline.run().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert_eq!(summary.reason, StopReason::RunTimeout);
    assert_eq!(summary.stats.cycles, 0);
    assert_eq!(sink.write_counts(), (0, 0));
}

#[test]
fn failed_sink_write_is_retried_on_the_next_cycle() {
    let sink = MemorySink::new();
    sink.fail_next_writes(1);
    let mut pipeline = pipeline(
        ScriptedSource::frames(3),
        ScriptedBackend::counts(&[3]),
        &sink,
        settings(),
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.stats.write_failures, 1);
    assert_eq!(summary.stats.writes, 1);
    assert_eq!(summary.stats.skipped_writes, 1);
    assert_eq!(sink.rows().len(), 1);
    assert_eq!(sink.rows()[0][3], "13");
}

#[test]
fn rate_limit_bounds_writes_in_a_run() {
    let sink = MemorySink::new();
    let mut run_settings = settings();
    run_settings.cadence = Cadence::FrameCount {
        interval: Duration::from_secs(10),
    };
    run_settings.cycle_pause = Duration::from_secs(10);
    run_settings.smoothing_window = 1;
    run_settings.update_min_interval = Duration::from_secs(60);
    // 1 fps over 10s: nine frames skipped per processed frame.
    let mut pipeline = pipeline(
        ScriptedSource::frames(80),
        ScriptedBackend::counts(&[1, 2, 3, 4, 5, 6, 7, 8]),
        &sink,
        run_settings,
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    // Cycles at t = 0, 10, ..., 70: writes at t = 0 and t = 60 only.
    assert_eq!(summary.stats.cycles, 8);
    assert_eq!(summary.stats.writes, 2);
    assert_eq!(summary.stats.skipped_writes, 6);
    assert_eq!(sink.rows()[0][3], "9");
}

#[test]
fn wall_clock_cadence_discards_frames_between_samples() {
    let sink = MemorySink::new();
    let mut run_settings = settings();
    run_settings.cadence = Cadence::WallClock {
        interval: Duration::from_secs(5),
    };
    run_settings.cycle_pause = Duration::ZERO;
    run_settings.run_timeout = Some(Duration::from_secs(20));
    let source = ScriptedSource::new(vec![Step::Frame; 1000], false);
    let mut pipeline = pipeline(
        source,
        ScriptedBackend::counts(&[2]),
        &sink,
        run_settings,
        StopSignal::new(),
    );

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.reason, StopReason::RunTimeout);
    // Samples at t = 0, 5, 10, 15.
    assert_eq!(summary.stats.cycles, 4);
    assert!(summary.stats.frames_discarded > 0);
    assert_eq!(
        summary.stats.frames_read,
        summary.stats.cycles + summary.stats.frames_discarded
    );
}
