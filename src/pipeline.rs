//! Pipeline driver.
//!
//! One sequential loop per frame source:
//!
//! ```text
//! Idle -> Sampling -> (EndOfStream -> Sampling)* -> Stopped
//! ```
//!
//! Each cycle pulls one frame on the configured cadence, runs detection,
//! maps detections to slots (or counts them when no slots are configured),
//! smooths the count and hands the estimate to the update gate. Cycle-local
//! failures are logged and counted; only source-open failures end a run
//! with an error.

use std::time::Duration;

use crate::config::{DetectorKind, ParkingConfig, SamplingMode, SinkKind};
use crate::detect::{AdapterConfig, DetectorAdapter, DetectorBackend, StubBackend};
use crate::error::PipelineError;
use crate::frame::{Frame, FrameRead};
use crate::gate::{GateDecision, GateOutcome, UpdateGate};
use crate::ingest::{open_source, FrameSource, SourceStats};
use crate::occupancy::{OccupancyMapper, ParkingSlot};
use crate::roi::RegionOfInterest;
use crate::schedule::{Clock, StopSignal, SystemClock};
use crate::sink::{publish_occupancy, MemorySink, RecordSink, SheetLayout};
use crate::smoothing::{MedianSmoother, SmoothedEstimate, DEFAULT_WINDOW};

/// FPS assumed for frame-count cadence when the source declares none.
pub const FALLBACK_FPS: f64 = 30.0;

/// How frames are picked for processing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cadence {
    /// Process a frame once `interval` has elapsed since the last one;
    /// frames read in between are discarded.
    WallClock { interval: Duration },
    /// Process every `round(fps * interval)`-th frame.
    FrameCount { interval: Duration },
}

impl Cadence {
    pub fn interval(&self) -> Duration {
        match self {
            Self::WallClock { interval } | Self::FrameCount { interval } => *interval,
        }
    }
}

/// Frames to advance per processed frame, at least one.
pub fn frames_per_cycle(fps: Option<f64>, interval: Duration) -> u64 {
    let fps = fps.filter(|f| f.is_finite() && *f > 0.0).unwrap_or(FALLBACK_FPS);
    let skip = (fps * interval.as_secs_f64()).round();
    if skip.is_finite() && skip >= 1.0 {
        skip as u64
    } else {
        1
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub cadence: Cadence,
    /// Pause after every processed frame.
    pub cycle_pause: Duration,
    /// Pause after a transient read failure.
    pub read_retry_pause: Duration,
    /// Rewind finite sources at end-of-stream instead of stopping.
    pub loop_on_eos: bool,
    pub eos_pause: Duration,
    pub max_reconnect_attempts: u32,
    pub run_timeout: Option<Duration>,
    /// Slot count when no slot geometry is configured.
    pub fallback_total_slots: usize,
    pub smoothing_window: usize,
    pub update_min_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cadence: Cadence::WallClock {
                interval: Duration::from_secs(2),
            },
            cycle_pause: Duration::ZERO,
            read_retry_pause: Duration::from_millis(200),
            loop_on_eos: true,
            eos_pause: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            run_timeout: None,
            fallback_total_slots: 16,
            smoothing_window: DEFAULT_WINDOW,
            update_min_interval: Duration::from_secs(30),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(cfg: &ParkingConfig) -> Self {
        let cadence = match cfg.sampling.mode {
            SamplingMode::WallClock => Cadence::WallClock {
                interval: cfg.frame_interval,
            },
            SamplingMode::FrameCount => Cadence::FrameCount {
                interval: cfg.frame_interval,
            },
        };
        Self {
            cadence,
            cycle_pause: cfg.sampling.cycle_pause,
            read_retry_pause: cfg.sampling.read_retry,
            loop_on_eos: cfg.end_of_stream.loop_video,
            eos_pause: cfg.end_of_stream.pause,
            max_reconnect_attempts: cfg.end_of_stream.max_reconnect_attempts,
            run_timeout: cfg.run_timeout,
            fallback_total_slots: cfg.total_slots,
            smoothing_window: cfg.smoothing_window,
            update_min_interval: cfg.update_min_interval,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Sampling,
    EndOfStream,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    StopRequested,
    RunTimeout,
    /// A finite source ended and looping is disabled.
    SourceExhausted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames_read: u64,
    pub frames_discarded: u64,
    pub cycles: u64,
    pub read_failures: u64,
    pub detection_failures: u64,
    pub writes: u64,
    /// Unchanged or rate-limited estimates.
    pub skipped_writes: u64,
    pub write_failures: u64,
    pub rewinds: u64,
    pub reconnects: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub reason: StopReason,
    pub stats: RunStats,
    /// Counters as the frame source reports them at the end of the run.
    pub source: SourceStats,
    pub last_estimate: Option<SmoothedEstimate>,
}

/// Result of processing one frame.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing was smoothed or gated.
    DetectionFailed(PipelineError),
    Estimated {
        raw_count: usize,
        estimate: SmoothedEstimate,
        gate: GateOutcome,
    },
    /// A write was due but the stop signal was raised or the run timed out
    /// first.
    Interrupted {
        raw_count: usize,
        estimate: SmoothedEstimate,
    },
}

enum Acquire {
    Frame(Frame),
    EndOfStream,
    Retry(String),
    Stop(StopReason),
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    adapter: DetectorAdapter,
    mapper: Option<OccupancyMapper>,
    smoother: MedianSmoother,
    gate: UpdateGate,
    sink: Box<dyn RecordSink>,
    layout: SheetLayout,
    settings: PipelineSettings,
    clock: Box<dyn Clock>,
    stop: StopSignal,
    state: DriverState,
    stats: RunStats,
    last_processed_at: Option<Duration>,
    last_estimate: Option<SmoothedEstimate>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        adapter: DetectorAdapter,
        sink: Box<dyn RecordSink>,
        settings: PipelineSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            source,
            adapter,
            mapper: None,
            smoother: MedianSmoother::new(settings.smoothing_window),
            gate: UpdateGate::new(settings.update_min_interval),
            sink,
            layout: SheetLayout::default(),
            settings,
            clock: Box::new(SystemClock::new()),
            stop,
            state: DriverState::Idle,
            stats: RunStats::default(),
            last_processed_at: None,
            last_estimate: None,
        }
    }

    /// Build every component from configuration.
    pub fn from_config(cfg: &ParkingConfig, stop: StopSignal) -> Result<Self, PipelineError> {
        let source = open_source(&cfg.source)?;
        let adapter = detector_from_config(cfg)?;
        let sink = sink_from_config(cfg)?;
        let pipeline = Self::new(source, adapter, sink, PipelineSettings::from_config(cfg), stop)
            .with_layout(SheetLayout::new(
                cfg.sink.row_id.clone(),
                cfg.sink.site_label.clone(),
            ))
            .with_slots(cfg.parking_slots.clone())?;
        Ok(pipeline)
    }

    /// Use per-slot geometry. An empty list keeps raw-count mode.
    pub fn with_slots(mut self, slots: Vec<ParkingSlot>) -> Result<Self, PipelineError> {
        self.mapper = if slots.is_empty() {
            None
        } else {
            Some(OccupancyMapper::new(slots)?)
        };
        Ok(self)
    }

    pub fn with_layout(mut self, layout: SheetLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn total_slots(&self) -> usize {
        self.mapper
            .as_ref()
            .map_or(self.settings.fallback_total_slots, |m| m.total_slots())
    }

    /// Run until stopped, timed out, or the source is exhausted.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        self.source.open().map_err(|e| {
            log::error!("{}", e);
            e
        })?;
        log::info!(
            "sampling {} ({:?}, total slots {}, {})",
            self.source.uri(),
            self.settings.cadence,
            self.total_slots(),
            if self.mapper.is_some() {
                "slot geometry"
            } else {
                "raw vehicle count"
            }
        );
        self.state = DriverState::Sampling;

        let reason = loop {
            if let Some(reason) = self.stop_reason() {
                break reason;
            }
            match self.acquire() {
                Acquire::Frame(frame) => {
                    self.process_frame(frame);
                    self.pause(self.settings.cycle_pause);
                }
                Acquire::Retry(reason) => {
                    self.stats.read_failures += 1;
                    log::warn!(
                        "frame read failed on {}: {}; retrying in {:?}",
                        self.source.uri(),
                        reason,
                        self.settings.read_retry_pause
                    );
                    self.pause(self.settings.read_retry_pause);
                }
                Acquire::EndOfStream => {
                    if let Some(reason) = self.handle_end_of_stream()? {
                        break reason;
                    }
                }
                Acquire::Stop(reason) => break reason,
            }
        };

        self.state = DriverState::Stopped;
        let summary = RunSummary {
            reason,
            stats: self.stats.clone(),
            source: self.source.stats(),
            last_estimate: self.last_estimate,
        };
        log::info!(
            "run stopped ({:?}): cycles={} writes={} skipped={} write_failures={} \
             detection_failures={} read_failures={}",
            summary.reason,
            summary.stats.cycles,
            summary.stats.writes,
            summary.stats.skipped_writes,
            summary.stats.write_failures,
            summary.stats.detection_failures,
            summary.stats.read_failures
        );
        Ok(summary)
    }

    /// Detect, map, smooth and gate one frame.
    pub fn process_frame(&mut self, frame: Frame) -> CycleOutcome {
        let index = frame.index;
        let budget = self
            .settings
            .run_timeout
            .map(|limit| limit.saturating_sub(self.clock.elapsed()));
        let detections = match self.adapter.detect_until(frame, &self.stop, budget) {
            Ok(detections) => detections,
            Err(err) if self.stop_reason().is_some() => {
                log::info!("frame {}: detection abandoned ({})", index, err);
                return CycleOutcome::DetectionFailed(err);
            }
            Err(err) => {
                self.stats.detection_failures += 1;
                log::warn!("frame {}: {}; skipping cycle", index, err);
                return CycleOutcome::DetectionFailed(err);
            }
        };

        let wall = self.clock.wall();
        let (raw_count, total) = match &self.mapper {
            Some(mapper) => {
                let snapshot = mapper.map(&detections, wall);
                log::debug!(
                    "frame {}: {} detections, occupied slots {:?}",
                    index,
                    detections.len(),
                    snapshot.occupied_slot_ids
                );
                (snapshot.occupied_count(), snapshot.total_slots)
            }
            None => (detections.len(), self.settings.fallback_total_slots),
        };
        let smoothed = self.smoother.push(raw_count);
        let estimate = SmoothedEstimate::from_counts(smoothed, total);
        self.stats.cycles += 1;
        self.last_estimate = Some(estimate);
        log::info!(
            "frame {}: vehicles raw={} smoothed={} -> free {}/{}",
            index,
            raw_count,
            smoothed,
            estimate.free_count,
            total
        );

        let now = self.clock.elapsed();
        if self.gate.decide(&estimate, now) == GateDecision::Write {
            if let Some(reason) = self.stop_reason() {
                log::info!("{:?}; not writing free={}", reason, estimate.free_count);
                return CycleOutcome::Interrupted {
                    raw_count,
                    estimate,
                };
            }
        }

        let sink = &mut self.sink;
        let layout = &self.layout;
        let gate = self.gate.submit(estimate, now, |est| {
            publish_occupancy(sink.as_mut(), layout, est, wall).map(|_| ())
        });
        match &gate {
            GateOutcome::Written => self.stats.writes += 1,
            GateOutcome::Unchanged => {
                self.stats.skipped_writes += 1;
                log::debug!("free count {} unchanged; no write", estimate.free_count);
            }
            GateOutcome::RateLimited { remaining } => {
                self.stats.skipped_writes += 1;
                log::debug!(
                    "free count changed to {} but next write allowed in {:?}",
                    estimate.free_count,
                    remaining
                );
            }
            GateOutcome::Failed(err) => {
                self.stats.write_failures += 1;
                log::warn!("{}; will retry on the next change", err);
            }
        }
        CycleOutcome::Estimated {
            raw_count,
            estimate,
            gate,
        }
    }

    fn acquire(&mut self) -> Acquire {
        match self.settings.cadence {
            Cadence::FrameCount { interval } => self.acquire_by_count(interval),
            Cadence::WallClock { interval } => self.acquire_by_time(interval),
        }
    }

    fn acquire_by_count(&mut self, interval: Duration) -> Acquire {
        let skip = frames_per_cycle(self.source.fps(), interval);
        for _ in 1..skip {
            if let Some(reason) = self.stop_reason() {
                return Acquire::Stop(reason);
            }
            match self.source.skip_frame() {
                FrameRead::Frame(_) => {
                    self.stats.frames_read += 1;
                    self.stats.frames_discarded += 1;
                }
                FrameRead::EndOfStream => return Acquire::EndOfStream,
                FrameRead::Failed(reason) => return Acquire::Retry(reason),
            }
        }
        match self.source.read() {
            FrameRead::Frame(frame) => {
                self.stats.frames_read += 1;
                self.last_processed_at = Some(self.clock.elapsed());
                Acquire::Frame(frame)
            }
            FrameRead::EndOfStream => Acquire::EndOfStream,
            FrameRead::Failed(reason) => Acquire::Retry(reason),
        }
    }

    fn acquire_by_time(&mut self, interval: Duration) -> Acquire {
        let fps = self
            .source
            .fps()
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(FALLBACK_FPS);
        let frame_period = Duration::try_from_secs_f64(1.0 / fps).unwrap_or(interval);
        loop {
            if let Some(reason) = self.stop_reason() {
                return Acquire::Stop(reason);
            }
            let frame = match self.source.read() {
                FrameRead::Frame(frame) => frame,
                FrameRead::EndOfStream => return Acquire::EndOfStream,
                FrameRead::Failed(reason) => return Acquire::Retry(reason),
            };
            self.stats.frames_read += 1;

            let now = self.clock.elapsed();
            let remaining = match self.last_processed_at {
                Some(last) => interval.saturating_sub(now.saturating_sub(last)),
                None => Duration::ZERO,
            };
            if remaining.is_zero() {
                self.last_processed_at = Some(now);
                return Acquire::Frame(frame);
            }
            self.stats.frames_discarded += 1;
            log::trace!("discarding frame {} ({:?} until next sample)", frame.index, remaining);
            self.pause(remaining.min(frame_period));
        }
    }

    fn handle_end_of_stream(&mut self) -> Result<Option<StopReason>, PipelineError> {
        self.state = DriverState::EndOfStream;
        let finite = self.source.is_finite();
        if finite && !self.settings.loop_on_eos {
            log::info!("{} exhausted; stopping", self.source.uri());
            return Ok(Some(StopReason::SourceExhausted));
        }

        log::info!(
            "end of stream on {}; {} in {:?}",
            self.source.uri(),
            if finite { "rewinding" } else { "reconnecting" },
            self.settings.eos_pause
        );
        if self.pause(self.settings.eos_pause) {
            return Ok(self.stop_reason());
        }

        if finite {
            match self.source.rewind() {
                Ok(()) => {
                    self.stats.rewinds += 1;
                    self.state = DriverState::Sampling;
                    return Ok(None);
                }
                Err(err) => log::warn!("rewind failed: {}; reopening", err),
            }
        }
        self.reconnect()
    }

    fn reconnect(&mut self) -> Result<Option<StopReason>, PipelineError> {
        let attempts = self.settings.max_reconnect_attempts;
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.source.open() {
                Ok(()) => {
                    self.stats.reconnects += 1;
                    self.state = DriverState::Sampling;
                    log::info!("reopened {} (attempt {})", self.source.uri(), attempt);
                    return Ok(None);
                }
                Err(err) => {
                    log::warn!("reopen attempt {}/{} failed: {}", attempt, attempts, err);
                    last_err = Some(err);
                }
            }
            if attempt < attempts && self.pause(self.settings.eos_pause) {
                return Ok(self.stop_reason());
            }
        }
        let err = last_err.unwrap_or_else(|| {
            PipelineError::source_open(self.source.uri(), "reconnect attempts exhausted")
        });
        log::error!("giving up on {}: {}", self.source.uri(), err);
        self.state = DriverState::Stopped;
        Err(err)
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if self.stop.is_stopped() {
            return Some(StopReason::StopRequested);
        }
        match self.settings.run_timeout {
            Some(limit) if self.clock.elapsed() >= limit => Some(StopReason::RunTimeout),
            _ => None,
        }
    }

    /// Sleep, bounded by the run timeout. Returns true if the run should end.
    fn pause(&self, duration: Duration) -> bool {
        let duration = match self.settings.run_timeout {
            Some(limit) => duration.min(limit.saturating_sub(self.clock.elapsed())),
            None => duration,
        };
        if !duration.is_zero() && self.clock.sleep(duration, &self.stop) {
            return true;
        }
        self.stop_reason().is_some()
    }
}

/// Detector adapter for the configured backend, ROI and filters.
pub fn detector_from_config(cfg: &ParkingConfig) -> Result<DetectorAdapter, PipelineError> {
    let region_mask = cfg
        .roi_path
        .as_deref()
        .map(RegionOfInterest::load)
        .transpose()
        .map_err(|e| PipelineError::configuration(format!("{:#}", e)))?;
    let backend = backend_from_config(cfg)?;
    let config = AdapterConfig {
        confidence_threshold: cfg.confidence_threshold,
        allowed_class_ids: if cfg.classes.is_empty() {
            None
        } else {
            Some(cfg.classes.iter().copied().collect())
        },
        region_mask,
        device: cfg.detector.device,
        timeout: cfg.detector.timeout,
    };
    DetectorAdapter::new(backend, config)
        .map_err(|e| PipelineError::configuration(format!("detector: {:#}", e)))
}

fn backend_from_config(cfg: &ParkingConfig) -> Result<Box<dyn DetectorBackend>, PipelineError> {
    match cfg.detector.backend {
        DetectorKind::Stub => Ok(Box::new(StubBackend::new(
            cfg.detector.stub.vehicles.clone(),
            cfg.detector.stub.miss_rate,
            cfg.detector.stub.seed,
        ))),
        #[cfg(feature = "backend-tract")]
        DetectorKind::Tract => {
            let backend =
                crate::detect::TractBackend::new(&cfg.model_path, cfg.detector.input_size)
                    .map_err(|e| PipelineError::configuration(format!("{:#}", e)))?
                    .with_iou_threshold(cfg.detector.iou_threshold);
            Ok(Box::new(backend))
        }
        #[cfg(not(feature = "backend-tract"))]
        DetectorKind::Tract => Err(PipelineError::configuration(
            "detector.backend = tract requires the backend-tract feature",
        )),
    }
}

/// Record sink for the configured kind.
pub fn sink_from_config(cfg: &ParkingConfig) -> Result<Box<dyn RecordSink>, PipelineError> {
    match cfg.sink.kind {
        SinkKind::Memory => {
            log::info!("sink: in-memory (nothing leaves the process)");
            Ok(Box::new(MemorySink::new()))
        }
        #[cfg(feature = "sink-sheets")]
        SinkKind::Sheets => {
            let sink = crate::sink::SheetsSink::new(crate::sink::SheetsConfig {
                sheet_key: cfg.sink.sheet_key.clone().unwrap_or_default(),
                worksheet: cfg.sink.worksheet.clone(),
                token: cfg.sink.token.clone().unwrap_or_default(),
                timeout: cfg.sink.timeout,
            })
            .map_err(|e| PipelineError::configuration(format!("{:#}", e)))?;
            Ok(Box::new(sink))
        }
        #[cfg(not(feature = "sink-sheets"))]
        SinkKind::Sheets => Err(PipelineError::configuration(
            "sink.kind = sheets requires the sink-sheets feature",
        )),
    }
}
