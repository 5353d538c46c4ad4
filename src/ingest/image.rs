//! Still image source.
//!
//! A snapshot (local file or http(s) URL) is a finite source of exactly one
//! frame. With end-of-stream looping enabled the driver re-fetches it after
//! each pause, which suits cameras that only publish periodic snapshots.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use crate::error::PipelineError;
use crate::frame::{Frame, FrameRead};

use super::{FrameSource, SourceStats};

const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ImageSource {
    uri: String,
    pending: Option<Frame>,
    consumed: bool,
    stats: SourceStats,
}

impl ImageSource {
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            stats: SourceStats {
                uri: uri.clone(),
                ..SourceStats::default()
            },
            uri,
            pending: None,
            consumed: false,
        }
    }

    fn load(&self) -> Result<Frame> {
        let bytes = if self.uri.starts_with("http://") || self.uri.starts_with("https://") {
            fetch_remote(&self.uri)?
        } else {
            std::fs::read(&self.uri).with_context(|| format!("read image {}", self.uri))?
        };
        let decoded = ::image::load_from_memory(&bytes)
            .with_context(|| format!("decode image {}", self.uri))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        Frame::new(decoded.into_raw(), width, height, 0)
    }
}

impl FrameSource for ImageSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn open(&mut self) -> Result<(), PipelineError> {
        let frame = self
            .load()
            .map_err(|e| PipelineError::source_open(&self.uri, format!("{:#}", e)))?;
        log::info!(
            "ImageSource: loaded {} ({}x{})",
            self.uri,
            frame.width,
            frame.height
        );
        self.pending = Some(frame);
        self.consumed = false;
        Ok(())
    }

    fn read(&mut self) -> FrameRead {
        if self.consumed {
            return FrameRead::EndOfStream;
        }
        match self.pending.take() {
            Some(frame) => {
                self.consumed = true;
                self.stats.frames_read += 1;
                FrameRead::Frame(frame)
            }
            None => FrameRead::Failed("image source not opened".to_string()),
        }
    }

    fn fps(&self) -> Option<f64> {
        None
    }

    fn is_finite(&self) -> bool {
        true
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        // Snapshots change between fetches, so rewinding means fetching again.
        let frame = self
            .load()
            .map_err(|e| PipelineError::FrameRead(format!("{:#}", e)))?;
        self.pending = Some(frame);
        self.consumed = false;
        self.stats.rewinds += 1;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

fn fetch_remote(uri: &str) -> Result<Vec<u8>> {
    let url = url::Url::parse(uri).context("parse image url")?;
    let agent = ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build();
    let response = agent.get(url.as_str()).call().context("fetch image")?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_IMAGE_BYTES + 1)
        .read_to_end(&mut bytes)
        .context("read image body")?;
    if bytes.len() as u64 > MAX_IMAGE_BYTES {
        return Err(anyhow!("image exceeds {} bytes", MAX_IMAGE_BYTES));
    }
    Ok(bytes)
}
