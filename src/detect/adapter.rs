//! Detector adapter: the only path from a frame to a `Detection` list.
//!
//! Per frame:
//! 1. Black out pixels outside the region of interest (the detector never
//!    sees them).
//! 2. Hand the frame to the backend on its worker thread and wait at most
//!    the configured timeout. A caller-supplied stop signal or run budget
//!    cuts the wait short.
//! 3. Validate every returned entry, then drop disallowed classes and
//!    anything under the confidence threshold.

use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::PipelineError;
use crate::frame::Frame;
use crate::roi::{RegionMask, RegionOfInterest};
use crate::schedule::StopSignal;

use super::backend::{DetectRequest, DetectorBackend, DeviceHint, RawDetection};
use super::result::Detection;

pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest single wait on the worker before the stop signal is re-checked.
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub confidence_threshold: f32,
    pub allowed_class_ids: Option<BTreeSet<u32>>,
    pub region_mask: Option<RegionOfInterest>,
    pub device: DeviceHint,
    pub timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.4,
            allowed_class_ids: None,
            region_mask: None,
            device: DeviceHint::Auto,
            timeout: DEFAULT_DETECT_TIMEOUT,
        }
    }
}

struct Job {
    seq: u64,
    frame: Frame,
    request: DetectRequest,
}

struct Reply {
    seq: u64,
    result: Result<Vec<RawDetection>>,
}

#[derive(Debug)]
pub struct DetectorAdapter {
    backend_name: &'static str,
    config: AdapterConfig,
    request: DetectRequest,
    mask: Option<RegionMask>,
    jobs: Sender<Job>,
    replies: Receiver<Reply>,
    next_seq: u64,
}

impl DetectorAdapter {
    /// Spawn the backend's worker thread. Warm-up runs before the first job.
    pub fn new(backend: Box<dyn DetectorBackend>, config: AdapterConfig) -> Result<Self> {
        let backend_name = backend.name();
        let (jobs, job_rx) = mpsc::channel::<Job>();
        let (reply_tx, replies) = mpsc::channel::<Reply>();
        thread::Builder::new()
            .name(format!("detector-{}", backend_name))
            .spawn(move || run_worker(backend, job_rx, reply_tx))?;

        let region_mask = config.region_mask.as_ref().filter(|roi| !roi.is_empty());
        let request = DetectRequest {
            confidence_threshold: config.confidence_threshold,
            classes: config
                .allowed_class_ids
                .as_ref()
                .map(|ids| ids.iter().copied().collect()),
            device: config.device,
        };
        log::info!(
            "detector adapter: backend={} conf>={:.2} classes={:?} roi_polygons={} timeout={:?}",
            backend_name,
            config.confidence_threshold,
            request.classes,
            region_mask.map_or(0, |roi| roi.polygons().len()),
            config.timeout
        );

        Ok(Self {
            backend_name,
            config,
            request,
            mask: None,
            jobs,
            replies,
            next_seq: 0,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Detect vehicles in one frame. Consumes the frame.
    pub fn detect(&mut self, frame: Frame) -> Result<Vec<Detection>, PipelineError> {
        self.detect_until(frame, &StopSignal::new(), None)
    }

    /// Like `detect`, but gives up as soon as `stop` is raised or `budget`
    /// (the time left in the run) is spent, whichever comes before the
    /// detector timeout. A reply arriving afterwards is discarded.
    pub fn detect_until(
        &mut self,
        mut frame: Frame,
        stop: &StopSignal,
        budget: Option<Duration>,
    ) -> Result<Vec<Detection>, PipelineError> {
        self.apply_mask(&mut frame)?;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs
            .send(Job {
                seq,
                frame,
                request: self.request.clone(),
            })
            .map_err(|_| PipelineError::Detection("detector worker stopped".to_string()))?;

        let raw = self.await_reply(seq, stop, budget)?;
        self.filter(raw)
    }

    fn apply_mask(&mut self, frame: &mut Frame) -> Result<(), PipelineError> {
        let Some(roi) = self.config.region_mask.as_ref().filter(|roi| !roi.is_empty()) else {
            return Ok(());
        };
        let stale = self.mask.as_ref().map_or(true, |mask| !mask.matches(frame));
        if stale {
            log::debug!(
                "rasterizing ROI mask for {}x{} frames",
                frame.width,
                frame.height
            );
            self.mask = Some(roi.rasterize(frame.width, frame.height));
        }
        if let Some(mask) = &self.mask {
            mask.apply(frame)
                .map_err(|e| PipelineError::Detection(format!("ROI mask: {}", e)))?;
        }
        Ok(())
    }

    fn await_reply(
        &self,
        seq: u64,
        stop: &StopSignal,
        budget: Option<Duration>,
    ) -> Result<Vec<RawDetection>, PipelineError> {
        let limit = budget.map_or(self.config.timeout, |b| b.min(self.config.timeout));
        let cut_by_budget = limit < self.config.timeout;
        let deadline = Instant::now() + limit;
        loop {
            if stop.is_stopped() {
                return Err(PipelineError::Detection(format!(
                    "stop requested while waiting for {}",
                    self.backend_name
                )));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PipelineError::Detection(if cut_by_budget {
                    format!("run timeout reached while waiting for {}", self.backend_name)
                } else {
                    format!(
                        "{} did not answer within {:?}",
                        self.backend_name, self.config.timeout
                    )
                }));
            }
            match self.replies.recv_timeout(remaining.min(CANCEL_POLL)) {
                Ok(reply) if reply.seq == seq => {
                    return reply.result.map_err(|e| {
                        PipelineError::Detection(format!("{}: {:#}", self.backend_name, e))
                    });
                }
                Ok(reply) => {
                    log::debug!("discarding late detector reply for frame seq {}", reply.seq);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::Detection(
                        "detector worker stopped".to_string(),
                    ));
                }
            }
        }
    }

    fn filter(&self, raw: Vec<RawDetection>) -> Result<Vec<Detection>, PipelineError> {
        let total = raw.len();
        let mut kept = Vec::with_capacity(total);
        for entry in raw {
            let det = Detection::from_raw(entry).map_err(|e| {
                PipelineError::Detection(format!("malformed detector output: {}", e))
            })?;
            if let Some(allowed) = &self.config.allowed_class_ids {
                if !allowed.contains(&det.class_id) {
                    continue;
                }
            }
            if det.confidence < self.config.confidence_threshold {
                continue;
            }
            kept.push(det);
        }
        if kept.len() != total {
            log::debug!(
                "adapter dropped {} of {} detections (class/confidence)",
                total - kept.len(),
                total
            );
        }
        Ok(kept)
    }
}

fn run_worker(mut backend: Box<dyn DetectorBackend>, jobs: Receiver<Job>, replies: Sender<Reply>) {
    if let Err(e) = backend.warm_up() {
        log::warn!("detector {} warm-up failed: {:#}", backend.name(), e);
    }
    for job in jobs {
        let result = backend.detect(&job.frame, &job.request);
        if replies
            .send(Reply {
                seq: job.seq,
                result,
            })
            .is_err()
        {
            break;
        }
    }
    log::debug!("detector {} worker exiting", backend.name());
}
