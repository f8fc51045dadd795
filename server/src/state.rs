//! Shared server state: the cached predictor and the background training job

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::info;

use chest_cancer_classifier::backend::{default_device, DefaultBackend};
use chest_cancer_classifier::inference::{Prediction, Predictor};
use chest_cancer_classifier::model::store;
use chest_cancer_classifier::{PipelineError, Result};

/// Output lines kept per training run
pub const OUTPUT_TAIL_LINES: usize = 200;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Trained model path (without extension)
    pub model_path: PathBuf,
    pub threshold: f32,
    /// Program and arguments run by `POST /train`
    pub pipeline_command: Vec<String>,
    /// Working directory of the pipeline command
    pub project_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Snapshot of a training run as reported by `/train/status`
#[derive(Debug, Clone, Serialize)]
pub struct TrainingJob {
    pub id: String,
    pub command: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Most recent stdout/stderr lines of the pipeline command
    pub output: VecDeque<String>,
}

impl TrainingJob {
    pub fn new(command: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command,
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            output: VecDeque::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }
}

#[derive(Default)]
struct TrainingSlot {
    job: Option<TrainingJob>,
    cancel: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: ServerConfig,
    predictor: Mutex<Option<Predictor<DefaultBackend>>>,
    training: Mutex<TrainingSlot>,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                predictor: Mutex::new(None),
                training: Mutex::new(TrainingSlot::default()),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    fn training(&self) -> MutexGuard<'_, TrainingSlot> {
        // A poisoned lock still holds consistent job data
        self.inner
            .training
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn predictor(&self) -> MutexGuard<'_, Option<Predictor<DefaultBackend>>> {
        self.inner
            .predictor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Classify upload bytes, loading the model on first use. Blocking.
    pub fn predict(&self, bytes: &[u8]) -> Result<Prediction> {
        let mut cached = self.predictor();
        let predictor = match cached.take() {
            Some(predictor) => predictor,
            None => {
                let c = self.config();
                if !store::model_exists(&c.model_path) {
                    return Err(PipelineError::ModelLoad(format!(
                        "no trained model at {}",
                        c.model_path.display()
                    )));
                }
                Predictor::load(&c.model_path, c.threshold, default_device())?
            }
        };
        let result = predictor.predict_bytes(bytes);
        *cached = Some(predictor);
        result
    }

    pub fn model_loaded(&self) -> bool {
        self.predictor().is_some()
    }

    /// Drop the cached model so the next prediction reloads it from disk
    pub fn invalidate_model(&self) {
        if self.predictor().take().is_some() {
            info!("Cached model dropped, next prediction reloads it");
        }
    }

    pub fn current_job(&self) -> Option<TrainingJob> {
        self.training().job.clone()
    }

    /// Register a new running job unless one is already running
    pub fn begin_job(&self, job: TrainingJob, cancel: oneshot::Sender<()>) -> std::result::Result<(), TrainingJob> {
        let mut slot = self.training();
        if let Some(current) = slot.job.as_ref().filter(|j| j.is_running()) {
            return Err(current.clone());
        }
        slot.job = Some(job);
        slot.cancel = Some(cancel);
        Ok(())
    }

    pub fn is_training(&self) -> bool {
        self.training().job.as_ref().is_some_and(|j| j.is_running())
    }

    pub fn push_output(&self, id: &str, line: String) {
        let mut slot = self.training();
        if let Some(job) = slot.job.as_mut().filter(|j| j.id == id) {
            if job.output.len() == OUTPUT_TAIL_LINES {
                job.output.pop_front();
            }
            job.output.push_back(line);
        }
    }

    pub fn finish_job(&self, id: &str, status: JobStatus, exit_code: Option<i32>) {
        let mut slot = self.training();
        if let Some(job) = slot.job.as_mut().filter(|j| j.id == id) {
            job.status = status;
            job.exit_code = exit_code;
            job.finished_at = Some(Utc::now());
            slot.cancel = None;
        }
    }

    /// Signal the running job to stop; false when nothing is running
    pub fn request_cancel(&self) -> bool {
        let mut slot = self.training();
        match slot.cancel.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}
