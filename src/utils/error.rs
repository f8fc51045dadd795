//! Error Handling Module
//!
//! One error type for every pipeline stage. Each variant corresponds to a
//! failure class of the pipeline; only tracking failures are recoverable.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or malformed configuration, or an output directory that cannot be created
    #[error("Configuration error: {0}")]
    Config(String),

    /// Download failed (connectivity, non-success status, interrupted transfer)
    #[error("Network error: {0}")]
    Network(String),

    /// Archive missing, truncated or not a supported format
    #[error("Archive error: {0}")]
    Archive(String),

    /// Model weights or description could not be loaded
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Experiment tracker unreachable or rejected a request
    #[error("Tracking error: {0}")]
    Tracking(String),

    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    Image(PathBuf, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input supplied by a caller (e.g. an upload that is not an image)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    /// Tracking failures are reported but never abort a stage.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Tracking(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

/// Convenience Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Extension trait for adding context to foreign errors.
///
/// The constructor picks the variant, so the same helper works for every stage:
/// `archive.by_index(i).context("reading entry", PipelineError::Archive)?`
pub trait ResultExt<T> {
    fn context(self, msg: &str, kind: fn(String) -> PipelineError) -> Result<T>;

    /// Lazy variant of [`ResultExt::context`]
    fn with_context<F: FnOnce() -> String>(
        self,
        kind: fn(String) -> PipelineError,
        f: F,
    ) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str, kind: fn(String) -> PipelineError) -> Result<T> {
        self.map_err(|e| kind(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(
        self,
        kind: fn(String) -> PipelineError,
        f: F,
    ) -> Result<T> {
        self.map_err(|e| kind(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str, kind: fn(String) -> PipelineError) -> Result<T> {
        self.ok_or_else(|| kind(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(
        self,
        kind: fn(String) -> PipelineError,
        f: F,
    ) -> Result<T> {
        self.ok_or_else(|| kind(f()))
    }
}
