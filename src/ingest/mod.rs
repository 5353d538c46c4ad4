//! Frame ingestion sources.
//!
//! This module provides different sources for decoded frames:
//! - Synthetic `stub://` lots (testing, demos)
//! - Still images, local or http(s) (feature: ingest-image)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - RTSP streams from IP cameras (feature: rtsp-gstreamer)
//!
//! All sources produce `Frame` instances that flow into the pipeline driver.
//! Sources only decode; sampling cadence is the driver's job.

#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
#[cfg(feature = "ingest-image")]
pub mod image;
#[cfg(feature = "rtsp-gstreamer")]
pub(crate) mod rtsp;
pub mod synthetic;

use crate::error::PipelineError;
use crate::frame::FrameRead;

#[cfg(feature = "ingest-image")]
pub use self::image::ImageSource;
pub use synthetic::SyntheticSource;

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_read: u64,
    pub rewinds: u64,
    pub uri: String,
}

/// Sequential frame source.
///
/// `open` may be called again after end-of-stream to reconnect a live source.
pub trait FrameSource: Send {
    /// Source URI or path, for logs.
    fn uri(&self) -> &str;

    /// Open (or reopen) the source.
    fn open(&mut self) -> Result<(), PipelineError>;

    /// Decode the next frame.
    fn read(&mut self) -> FrameRead;

    /// Advance past one frame the caller intends to discard.
    ///
    /// Sources that can skip without converting pixels should override this.
    fn skip_frame(&mut self) -> FrameRead {
        self.read()
    }

    /// Declared frame rate, when the container or stream reports one.
    fn fps(&self) -> Option<f64>;

    /// True for files and images, false for live streams.
    fn is_finite(&self) -> bool;

    /// Seek back to the first frame of a finite source.
    fn rewind(&mut self) -> Result<(), PipelineError>;

    fn stats(&self) -> SourceStats;
}

/// Build the source matching a URI.
///
/// - `stub://...` synthetic lot
/// - `*.jpg`, `*.jpeg`, `*.png` still image
/// - `rtsp://...` GStreamer stream
/// - anything else: local video file
pub fn open_source(uri: &str) -> Result<Box<dyn FrameSource>, PipelineError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(PipelineError::configuration("source must not be empty"));
    }
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::from_uri(uri)?));
    }
    if is_still_image(uri) {
        #[cfg(feature = "ingest-image")]
        {
            return Ok(Box::new(ImageSource::new(uri)));
        }
        #[cfg(not(feature = "ingest-image"))]
        {
            return Err(PipelineError::configuration(
                "still image sources require the ingest-image feature",
            ));
        }
    }
    if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            return Ok(Box::new(rtsp::GstreamerRtspSource::new(uri)));
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            return Err(PipelineError::configuration(
                "RTSP requires the rtsp-gstreamer feature",
            ));
        }
    }
    if uri.contains("://") {
        return Err(PipelineError::configuration(format!(
            "unsupported source scheme in '{}'",
            uri
        )));
    }
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(file_ffmpeg::FfmpegFileSource::new(uri)))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Err(PipelineError::configuration(
            "video file ingestion requires the ingest-file-ffmpeg feature",
        ))
    }
}

fn is_still_image(uri: &str) -> bool {
    let path = uri.split(['?', '#']).next().unwrap_or(uri).to_lowercase();
    [".jpg", ".jpeg", ".png"]
        .iter()
        .any(|ext| path.ends_with(ext))
}
