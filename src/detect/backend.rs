use anyhow::Result;

use crate::frame::Frame;

/// Device preference forwarded to the backend. Selection is the backend's
/// concern; the pipeline never assumes a GPU is present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceHint {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl std::str::FromStr for DeviceHint {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "gpu" | "cuda" => Ok(Self::Gpu),
            other => Err(anyhow::anyhow!(
                "unknown device '{}'; expected auto, cpu or gpu",
                other
            )),
        }
    }
}

/// Parameters passed upstream with every frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectRequest {
    pub confidence_threshold: f32,
    /// When set, only these class ids should be returned.
    pub classes: Option<Vec<u32>>,
    pub device: DeviceHint,
}

impl DetectRequest {
    pub fn allows(&self, class_id: u32) -> bool {
        self.classes
            .as_ref()
            .map_or(true, |classes| classes.contains(&class_id))
    }
}

/// Unvalidated detector output, frame pixel coordinates `[x1, y1, x2, y2]`.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub class_name: Option<String>,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// Detector backend trait.
///
/// This is the boundary to the external object detector. Implementations own
/// model loading and inference; the adapter owns masking, filtering and
/// validation of whatever comes back.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Implementations should honor the confidence threshold and class filter
    /// in the request, but the adapter re-checks both.
    fn detect(&mut self, frame: &Frame, request: &DetectRequest) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
