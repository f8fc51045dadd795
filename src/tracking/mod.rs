//! Experiment tracking
//!
//! [`ExperimentTracker`] is implemented by an MLflow REST client (for
//! `http(s)` tracking URIs) and by a local file store using the MLflow
//! `mlruns` directory layout (for `file:` URIs and plain paths).
//! Every failure surfaces as [`PipelineError::Tracking`], which callers treat
//! as non-fatal.

pub mod file_store;
pub mod mlflow;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use file_store::LocalFileTracker;
pub use mlflow::{Credentials, MlflowRestTracker};

use crate::utils::error::{PipelineError, Result};

/// Whether the evaluated model is pushed to the model registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// Register whenever the backend has a registry (remote servers)
    #[default]
    Auto,
    Always,
    Never,
}

impl RegistryMode {
    /// `Always` on a backend without a registry is attempted so the error gets reported
    pub fn should_register(&self, tracker: &dyn ExperimentTracker) -> bool {
        match self {
            RegistryMode::Auto => tracker.supports_registry(),
            RegistryMode::Always => true,
            RegistryMode::Never => false,
        }
    }
}

/// Identifies a started run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub experiment_id: String,
    pub run_id: String,
    pub artifact_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

pub trait ExperimentTracker {
    /// Short name for logs
    fn backend_name(&self) -> &'static str;

    fn supports_registry(&self) -> bool;

    /// Get-or-create the experiment and open a run in it
    fn start_run(&self, experiment: &str, run_name: &str) -> Result<RunHandle>;

    fn log_params(&self, run: &RunHandle, params: &BTreeMap<String, String>) -> Result<()>;

    fn log_metrics(&self, run: &RunHandle, metrics: &BTreeMap<String, f64>) -> Result<()>;

    /// Upload a local file under `artifact_path` inside the run's artifact root
    fn log_artifact(&self, run: &RunHandle, local: &Path, artifact_path: &str) -> Result<()>;

    /// Register the artifacts under `artifact_path` as a new version of `name`; returns the version
    fn register_model(&self, run: &RunHandle, name: &str, artifact_path: &str) -> Result<String>;

    fn end_run(&self, run: &RunHandle, status: RunStatus) -> Result<()>;
}

/// Pick a tracker implementation from the tracking URI
pub fn tracker_for_uri(uri: &str) -> Result<Box<dyn ExperimentTracker>> {
    let uri = uri.trim();
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Box::new(MlflowRestTracker::new(uri, Credentials::from_env())?));
    }
    if let Some(path) = local_store_path(uri) {
        return Ok(Box::new(LocalFileTracker::new(path)));
    }
    Err(PipelineError::Tracking(format!(
        "unsupported tracking URI scheme: {}",
        uri
    )))
}

/// Local directory for `file:` URIs and scheme-less paths
pub fn local_store_path(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if let Some(rest) = uri.strip_prefix("file:") {
        return Some(PathBuf::from(rest));
    }
    if uri.is_empty() || uri.contains("://") {
        return None;
    }
    Some(PathBuf::from(uri))
}

/// Milliseconds since the Unix epoch, as MLflow expects
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
