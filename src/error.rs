//! Failure taxonomy for a pipeline run.
//!
//! Only `SourceOpen` and `Configuration` end a run. Everything else is local to
//! one cycle: the driver logs it and moves on to the next frame.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The frame source could not be opened (or reopened after a drop).
    #[error("failed to open frame source {uri}: {reason}")]
    SourceOpen { uri: String, reason: String },

    /// A transient read/grab failure. The driver pauses and retries.
    #[error("frame read failed: {0}")]
    FrameRead(String),

    /// The detector call failed, timed out or returned malformed output.
    #[error("detection failed: {0}")]
    Detection(String),

    /// The external record store rejected or never acknowledged a write.
    #[error("sink write failed: {0}")]
    SinkWrite(String),

    /// Malformed or missing configuration. Raised before any frame is read.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn source_open(uri: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SourceOpen {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(err: impl std::fmt::Display) -> Self {
        Self::Configuration(err.to_string())
    }

    /// True for failures that terminate the run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::SourceOpen { .. } | Self::Configuration(_))
    }
}
