use std::path::PathBuf;
use thiserror::Error;

/// Error kinds raised by the per-frame pipeline and its collaborators.
///
/// Only `ModelLoad` is fatal. Everything else is either surfaced to the caller
/// that asked for a change (background, recording) or absorbed by the tick
/// loop, which falls back to publishing the unmodified frame.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to load segmentation model from {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load background {path}: {reason}")]
    BackgroundLoad { path: PathBuf, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("failed to decode asset {path}: {reason}")]
    AssetDecode { path: PathBuf, reason: String },

    #[error("recording error: {0}")]
    Recording(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("display error: {0}")]
    Display(String),
}

impl PipelineError {
    /// Errors that make the pipeline unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::ModelLoad { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
