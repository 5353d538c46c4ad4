//! RTSP frame source using GStreamer.
//!
//! The appsink keeps only the newest decoded buffer (`max-buffers=1
//! drop=true`), so a slow pipeline cycle always sees a fresh frame rather
//! than a backlog. End-of-stream and bus errors are reported to the driver,
//! which reconnects by calling `open` again.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::{FrameSource, SourceStats};
use crate::error::PipelineError;
use crate::frame::{Frame, FrameRead};

const PULL_TIMEOUT: Duration = Duration::from_secs(5);

struct Pipeline {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

pub(crate) struct GstreamerRtspSource {
    url: String,
    active: Option<Pipeline>,
    position: u64,
    fps: Option<f64>,
    stats: SourceStats,
}

impl GstreamerRtspSource {
    pub(crate) fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            active: None,
            position: 0,
            fps: None,
            stats: SourceStats {
                uri: url.to_string(),
                ..SourceStats::default()
            },
        }
    }

    fn build(&self) -> Result<Pipeline> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;

        Ok(Pipeline { pipeline, appsink })
    }

    fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.pipeline.set_state(gstreamer::State::Null);
        }
    }

    /// Drain the bus; `Some` carries the reason the stream stopped.
    fn poll_bus(&self) -> Option<BusEvent> {
        let active = self.active.as_ref()?;
        let bus = active.pipeline.bus()?;
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Some(BusEvent::Error(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => return Some(BusEvent::Eos),
                _ => {}
            }
        }
        None
    }

    fn pull(&mut self) -> Result<Option<Frame>> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| anyhow!("RTSP source not opened"))?;
        let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let Some(sample) = active.appsink.try_pull_sample(timeout) else {
            return Ok(None);
        };
        if self.fps.is_none() {
            self.fps = sample_fps(&sample);
        }
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        let frame = Frame::new(pixels, width, height, self.position)?;
        Ok(Some(frame))
    }
}

enum BusEvent {
    Eos,
    Error(String),
}

impl FrameSource for GstreamerRtspSource {
    fn uri(&self) -> &str {
        &self.url
    }

    fn open(&mut self) -> Result<(), PipelineError> {
        self.shutdown();
        let active = self
            .build()
            .map_err(|e| PipelineError::source_open(&self.url, format!("{:#}", e)))?;
        self.active = Some(active);
        self.position = 0;
        log::info!("RtspSource: connected to {}", self.url);
        Ok(())
    }

    fn read(&mut self) -> FrameRead {
        match self.poll_bus() {
            Some(BusEvent::Eos) => {
                self.shutdown();
                return FrameRead::EndOfStream;
            }
            Some(BusEvent::Error(reason)) => {
                log::warn!("RtspSource: {}", reason);
                self.shutdown();
                return FrameRead::EndOfStream;
            }
            None => {}
        }
        if self.active.is_none() {
            return FrameRead::EndOfStream;
        }
        match self.pull() {
            Ok(Some(frame)) => {
                self.position += 1;
                self.stats.frames_read += 1;
                FrameRead::Frame(frame)
            }
            Ok(None) => FrameRead::Failed("RTSP stream stalled".to_string()),
            Err(e) => FrameRead::Failed(format!("{:#}", e)),
        }
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn is_finite(&self) -> bool {
        false
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        Err(PipelineError::FrameRead(
            "live RTSP streams cannot rewind".to_string(),
        ))
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sample_fps(sample: &gstreamer::Sample) -> Option<f64> {
    let caps = sample.caps()?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).ok()?;
    let rate = info.fps();
    if rate.numer() > 0 && rate.denom() > 0 {
        Some(rate.numer() as f64 / rate.denom() as f64)
    } else {
        None
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer is shorter than its caps")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
