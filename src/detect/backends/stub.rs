use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::detect::backend::{DetectRequest, DetectorBackend, RawDetection};
use crate::frame::Frame;

/// COCO class id used for stub vehicles.
const STUB_CLASS_CAR: u32 = 2;
const STUB_CONFIDENCE: f32 = 0.9;

/// Stub backend for tests and demos.
///
/// Reports a fixed set of parked vehicles. Each vehicle is independently
/// missed with probability `miss_rate` (seeded, so runs are reproducible),
/// and a vehicle whose centroid pixel was masked to black is never reported.
pub struct StubBackend {
    vehicles: Vec<[f32; 4]>,
    miss_rate: f64,
    rng: StdRng,
}

impl StubBackend {
    pub fn new(vehicles: Vec<[f32; 4]>, miss_rate: f64, seed: u64) -> Self {
        Self {
            vehicles,
            miss_rate: if miss_rate.is_finite() {
                miss_rate.clamp(0.0, 1.0)
            } else {
                0.0
            },
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn centroid_visible(frame: &Frame, bbox: &[f32; 4]) -> bool {
        let cx = ((bbox[0] + bbox[2]) / 2.0).max(0.0) as u32;
        let cy = ((bbox[1] + bbox[3]) / 2.0).max(0.0) as u32;
        match frame.rgb_at(cx, cy) {
            Some(rgb) => rgb != [0, 0, 0],
            // Off-frame vehicles are reported as-is.
            None => true,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(Vec::new(), 0.0, 7)
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame, request: &DetectRequest) -> Result<Vec<RawDetection>> {
        if !request.allows(STUB_CLASS_CAR) || STUB_CONFIDENCE < request.confidence_threshold {
            return Ok(Vec::new());
        }
        let mut detections = Vec::with_capacity(self.vehicles.len());
        for bbox in &self.vehicles {
            // Draw for every vehicle so the miss pattern does not depend on masking.
            let missed = self.rng.gen_bool(self.miss_rate);
            if missed || !Self::centroid_visible(frame, bbox) {
                continue;
            }
            detections.push(RawDetection {
                class_id: STUB_CLASS_CAR,
                class_name: None,
                confidence: STUB_CONFIDENCE,
                bbox: *bbox,
            });
        }
        Ok(detections)
    }
}
