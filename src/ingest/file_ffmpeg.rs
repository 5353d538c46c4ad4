//! Local video file source using FFmpeg.
//!
//! Frames are decoded in-memory and converted to RGB24. The declared stream
//! frame rate drives frame-count sampling; rewinding seeks to the start so a
//! recorded clip can be replayed as a stand-in for a live camera.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{FrameSource, SourceStats};
use crate::error::PipelineError;
use crate::frame::{Frame, FrameRead};

struct Decoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: Option<f64>,
    flushed: bool,
}

pub(crate) struct FfmpegFileSource {
    path: String,
    decoder: Option<Decoder>,
    position: u64,
    stats: SourceStats,
}

impl FfmpegFileSource {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            decoder: None,
            position: 0,
            stats: SourceStats {
                uri: path.to_string(),
                ..SourceStats::default()
            },
        }
    }

    fn open_decoder(&self) -> Result<Decoder> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&self.path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", self.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let fps = if rate.denominator() != 0 && rate.numerator() > 0 {
            Some(f64::from(rate))
        } else {
            None
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Decoder {
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            flushed: false,
        })
    }

    /// Decode the next video frame; `Ok(None)` at end of file.
    fn next_decoded(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let state = self
            .decoder
            .as_mut()
            .ok_or_else(|| anyhow!("file source not opened"))?;
        let mut decoded = ffmpeg::frame::Video::empty();

        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(Some(decoded));
            }
            if state.flushed {
                return Ok(None);
            }
            match state.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != state.stream_index {
                        continue;
                    }
                    state
                        .decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    state.decoder.send_eof().context("flush ffmpeg decoder")?;
                    state.flushed = true;
                }
            }
        }
    }

    fn to_frame(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let state = self
            .decoder
            .as_mut()
            .ok_or_else(|| anyhow!("file source not opened"))?;
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        state
            .scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        Frame::new(pixels, width, height, self.position)
    }
}

impl FrameSource for FfmpegFileSource {
    fn uri(&self) -> &str {
        &self.path
    }

    fn open(&mut self) -> Result<(), PipelineError> {
        let decoder = self
            .open_decoder()
            .map_err(|e| PipelineError::source_open(&self.path, format!("{:#}", e)))?;
        log::info!(
            "FileSource: connected to {} (ffmpeg, fps={:?})",
            self.path,
            decoder.fps
        );
        self.decoder = Some(decoder);
        self.position = 0;
        Ok(())
    }

    fn read(&mut self) -> FrameRead {
        let decoded = match self.next_decoded() {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return FrameRead::EndOfStream,
            Err(e) => return FrameRead::Failed(format!("{:#}", e)),
        };
        let frame = match self.to_frame(&decoded) {
            Ok(frame) => frame,
            Err(e) => return FrameRead::Failed(format!("{:#}", e)),
        };
        self.position += 1;
        self.stats.frames_read += 1;
        FrameRead::Frame(frame)
    }

    fn skip_frame(&mut self) -> FrameRead {
        match self.next_decoded() {
            Ok(Some(_)) => {
                self.position += 1;
                self.stats.frames_read += 1;
                match Frame::new(Vec::new(), 0, 0, self.position - 1) {
                    Ok(frame) => FrameRead::Frame(frame),
                    Err(e) => FrameRead::Failed(e.to_string()),
                }
            }
            Ok(None) => FrameRead::EndOfStream,
            Err(e) => FrameRead::Failed(format!("{:#}", e)),
        }
    }

    fn fps(&self) -> Option<f64> {
        self.decoder.as_ref().and_then(|d| d.fps)
    }

    fn is_finite(&self) -> bool {
        true
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        let state = self
            .decoder
            .as_mut()
            .ok_or_else(|| PipelineError::FrameRead("file source not opened".to_string()))?;
        state
            .input
            .seek(0, ..)
            .map_err(|e| PipelineError::FrameRead(format!("seek to start: {}", e)))?;
        state.decoder.flush();
        state.flushed = false;
        self.position = 0;
        self.stats.rewinds += 1;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
