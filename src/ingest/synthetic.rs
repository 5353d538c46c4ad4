//! Synthetic frame source (`stub://`) for tests and demos.
//!
//! URI form: `stub://name?frames=N&fps=F&width=W&height=H`. Without `frames`
//! the source behaves like a live stream and never ends. Pixels are a moving
//! pattern that is never pure black, so a masked-out region is always
//! distinguishable from scene content.

use crate::error::PipelineError;
use crate::frame::{Frame, FrameRead};

use super::{FrameSource, SourceStats};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: f64 = 10.0;

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Total frames before end-of-stream. `None` means live.
    pub frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            frames: None,
        }
    }
}

pub struct SyntheticSource {
    uri: String,
    config: SyntheticConfig,
    opened: bool,
    position: u64,
    stats: SourceStats,
}

impl SyntheticSource {
    pub fn new(uri: impl Into<String>, config: SyntheticConfig) -> Self {
        let uri = uri.into();
        Self {
            stats: SourceStats {
                uri: uri.clone(),
                ..SourceStats::default()
            },
            uri,
            config,
            opened: false,
            position: 0,
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, PipelineError> {
        let config = parse_stub_uri(uri)?;
        Ok(Self::new(uri, config))
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn exhausted(&self) -> bool {
        self.config
            .frames
            .is_some_and(|total| self.position >= total)
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = self.config.width as usize * self.config.height as usize * 3;
        let shift = self.position as usize;
        (0..pixel_count)
            .map(|i| 1 + ((i + shift) % 254) as u8)
            .collect()
    }
}

impl FrameSource for SyntheticSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn open(&mut self) -> Result<(), PipelineError> {
        self.opened = true;
        log::info!("SyntheticSource: connected to {}", self.uri);
        Ok(())
    }

    fn read(&mut self) -> FrameRead {
        if !self.opened {
            return FrameRead::Failed("synthetic source not opened".to_string());
        }
        if self.exhausted() {
            return FrameRead::EndOfStream;
        }
        let pixels = self.generate_pixels();
        let index = self.position;
        self.position += 1;
        self.stats.frames_read += 1;
        match Frame::new(pixels, self.config.width, self.config.height, index) {
            Ok(frame) => FrameRead::Frame(frame),
            Err(e) => FrameRead::Failed(e.to_string()),
        }
    }

    fn skip_frame(&mut self) -> FrameRead {
        if !self.opened {
            return FrameRead::Failed("synthetic source not opened".to_string());
        }
        if self.exhausted() {
            return FrameRead::EndOfStream;
        }
        self.position += 1;
        self.stats.frames_read += 1;
        // Skipped frames carry no pixels worth building.
        match Frame::new(Vec::new(), 0, 0, self.position - 1) {
            Ok(frame) => FrameRead::Frame(frame),
            Err(e) => FrameRead::Failed(e.to_string()),
        }
    }

    fn fps(&self) -> Option<f64> {
        Some(self.config.fps)
    }

    fn is_finite(&self) -> bool {
        self.config.frames.is_some()
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        if !self.is_finite() {
            return Err(PipelineError::FrameRead(
                "live synthetic source cannot rewind".to_string(),
            ));
        }
        self.position = 0;
        self.stats.rewinds += 1;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

fn parse_stub_uri(uri: &str) -> Result<SyntheticConfig, PipelineError> {
    let rest = uri
        .strip_prefix("stub://")
        .ok_or_else(|| PipelineError::configuration(format!("not a stub uri: {}", uri)))?;
    let mut config = SyntheticConfig::default();
    let Some((_, query)) = rest.split_once('?') else {
        return Ok(config);
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let bad = |what: &str| {
            PipelineError::configuration(format!("stub uri {}: invalid {} '{}'", uri, what, value))
        };
        match key {
            "frames" => config.frames = Some(value.parse().map_err(|_| bad("frames"))?),
            "fps" => {
                let fps: f64 = value.parse().map_err(|_| bad("fps"))?;
                if !(fps.is_finite() && fps > 0.0) {
                    return Err(bad("fps"));
                }
                config.fps = fps;
            }
            "width" => config.width = value.parse().map_err(|_| bad("width"))?,
            "height" => config.height = value.parse().map_err(|_| bad("height"))?,
            other => log::warn!("stub uri {}: ignoring unknown parameter '{}'", uri, other),
        }
    }
    if config.width == 0 || config.height == 0 {
        return Err(PipelineError::configuration(format!(
            "stub uri {}: frame size must be non-zero",
            uri
        )));
    }
    Ok(config)
}
