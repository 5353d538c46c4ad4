use anyhow::{anyhow, Result};

use crate::geometry::BBox;

use super::backend::RawDetection;

/// A validated vehicle detection for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(class_id: u32, class_name: impl Into<String>, confidence: f32, bbox: BBox) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!(
                "confidence {} outside [0, 1] for class {}",
                confidence,
                class_id
            ));
        }
        Ok(Self {
            class_id,
            class_name: class_name.into(),
            confidence,
            bbox,
        })
    }

    /// Validate backend output; missing class names come from the COCO table.
    pub fn from_raw(raw: RawDetection) -> Result<Self> {
        let [x1, y1, x2, y2] = raw.bbox;
        let bbox = BBox::new(x1 as f64, y1 as f64, x2 as f64, y2 as f64)?;
        let class_name = raw
            .class_name
            .unwrap_or_else(|| coco_class_name(raw.class_id));
        Self::new(raw.class_id, class_name, raw.confidence, bbox)
    }
}

/// COCO-80 label for the classes a parking lot cares about.
pub fn coco_class_name(class_id: u32) -> String {
    match class_id {
        0 => "person",
        1 => "bicycle",
        2 => "car",
        3 => "motorcycle",
        5 => "bus",
        7 => "truck",
        _ => return format!("class_{}", class_id),
    }
    .to_string()
}
