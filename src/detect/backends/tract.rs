#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectRequest, DetectorBackend, DeviceHint, RawDetection};
use crate::detect::result::coco_class_name;
use crate::frame::Frame;

/// Letterbox padding value (YOLO convention).
const PAD_VALUE: u8 = 114;

/// Tract-based YOLOv8 backend.
///
/// Expects an Ultralytics ONNX export with output `[1, 4 + classes, anchors]`
/// (center-x, center-y, width, height, then one score per class). Runs on the
/// CPU; tract has no GPU execution provider.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    iou_threshold: f32,
    warned_device: bool,
}

struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for `input_size` square input.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, side, side]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "tract backend loaded {} ({}x{} input)",
            model_path.display(),
            input_size,
            input_size
        );

        Ok(Self {
            model,
            input_size,
            iou_threshold: 0.45,
            warned_device: false,
        })
    }

    /// Override the default NMS IoU threshold.
    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<(Tensor, Letterbox)> {
        if frame.width == 0 || frame.height == 0 {
            return Err(anyhow!("empty frame"));
        }
        let side = self.input_size as usize;
        let (src_w, src_h) = (frame.width as usize, frame.height as usize);
        let scale = (side as f32 / src_w as f32).min(side as f32 / src_h as f32);
        let scaled_w = ((src_w as f32 * scale) as usize).clamp(1, side);
        let scaled_h = ((src_h as f32 * scale) as usize).clamp(1, side);
        let pad_x = (side - scaled_w) / 2;
        let pad_y = (side - scaled_h) / 2;

        let pixels = frame.pixels();
        let x_ratio = src_w as f32 / scaled_w as f32;
        let y_ratio = src_h as f32 / scaled_h as f32;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let inside = x >= pad_x && x < pad_x + scaled_w && y >= pad_y && y < pad_y + scaled_h;
            let value = if inside {
                // Nearest-neighbour resample into the letterboxed canvas.
                let sx = (((x - pad_x) as f32 + 0.5) * x_ratio) as usize;
                let sy = (((y - pad_y) as f32 + 0.5) * y_ratio) as usize;
                pixels[(sy.min(src_h - 1) * src_w + sx.min(src_w - 1)) * 3 + c]
            } else {
                PAD_VALUE
            };
            value as f32 / 255.0
        });

        Ok((
            input.into_tensor(),
            Letterbox {
                scale,
                pad_x: pad_x as f32,
                pad_y: pad_y as f32,
            },
        ))
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        letterbox: &Letterbox,
        frame: &Frame,
        request: &DetectRequest,
    ) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let (rows, anchors) = (shape[1], shape[2]);
        let max_x = frame.width as f32;
        let max_y = frame.height as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = 0.0f32;
            for c in 0..rows - 4 {
                let score = view[[0, 4 + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            let class_id = best_class as u32;
            if best_score < request.confidence_threshold || !request.allows(class_id) {
                continue;
            }

            let (cx, cy, w, h) = (
                view[[0, 0, i]],
                view[[0, 1, i]],
                view[[0, 2, i]],
                view[[0, 3, i]],
            );
            let unletterbox = |v: f32, pad: f32, max: f32| ((v - pad) / letterbox.scale).clamp(0.0, max);
            let bbox = [
                unletterbox(cx - w / 2.0, letterbox.pad_x, max_x),
                unletterbox(cy - h / 2.0, letterbox.pad_y, max_y),
                unletterbox(cx + w / 2.0, letterbox.pad_x, max_x),
                unletterbox(cy + h / 2.0, letterbox.pad_y, max_y),
            ];
            candidates.push(RawDetection {
                class_id,
                class_name: Some(coco_class_name(class_id)),
                confidence: best_score.min(1.0),
                bbox,
            });
        }

        Ok(nms(candidates, self.iou_threshold))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame, request: &DetectRequest) -> Result<Vec<RawDetection>> {
        if request.device == DeviceHint::Gpu && !self.warned_device {
            log::warn!("tract backend runs on CPU only; ignoring gpu device hint");
            self.warned_device = true;
        }
        let (input, letterbox) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, &letterbox, frame, request)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size as usize;
        let blank = tract_ndarray::Array4::<f32>::zeros((1, 3, side, side)).into_tensor();
        self.model
            .run(tvec!(blank.into()))
            .context("ONNX warm-up inference failed")?;
        Ok(())
    }
}

/// Class-agnostic non-maximum suppression, highest confidence first.
fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<RawDetection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(&k.bbox, &det.bbox) < iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
