//! Local tracker writing the MLflow `mlruns` directory layout
//!
//! ```text
//! <root>/<experiment_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/params/<key>
//! <root>/<experiment_id>/<run_id>/metrics/<key>     "<timestamp> <value> <step>"
//! <root>/<experiment_id>/<run_id>/tags/mlflow.runName
//! <root>/<experiment_id>/<run_id>/artifacts/...
//! ```
//!
//! `mlflow ui --backend-store-uri <root>` can browse the result.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{now_millis, ExperimentTracker, RunHandle, RunStatus};
use crate::utils::error::{PipelineError, Result, ResultExt};

#[derive(Debug, Serialize, Deserialize)]
struct ExperimentMeta {
    experiment_id: String,
    name: String,
    artifact_location: String,
    lifecycle_stage: String,
    creation_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunMeta {
    run_id: String,
    run_uuid: String,
    run_name: String,
    experiment_id: String,
    artifact_uri: String,
    lifecycle_stage: String,
    /// 1 running, 3 finished, 4 failed
    status: u8,
    start_time: i64,
    end_time: Option<i64>,
    user_id: String,
}

pub struct LocalFileTracker {
    root: PathBuf,
}

impl LocalFileTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run: &RunHandle) -> PathBuf {
        self.root.join(&run.experiment_id).join(&run.run_id)
    }

    fn find_experiment(&self, name: &str) -> Result<Option<ExperimentMeta>> {
        if !self.root.exists() {
            return Ok(None);
        }
        let entries = fs::read_dir(&self.root).context("reading tracking store", PipelineError::Tracking)?;
        for entry in entries.flatten() {
            let meta_path = entry.path().join("meta.yaml");
            if !meta_path.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&meta_path).context("reading experiment meta", PipelineError::Tracking)?;
            if let Ok(meta) = serde_yaml::from_str::<ExperimentMeta>(&raw) {
                if meta.name == name {
                    return Ok(Some(meta));
                }
            }
        }
        Ok(None)
    }

    fn next_experiment_id(&self) -> u64 {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<u64>().ok()))
                    .max()
                    .map(|max| max + 1)
                    .unwrap_or(1)
            })
            .unwrap_or(1)
    }

    fn create_experiment(&self, name: &str) -> Result<ExperimentMeta> {
        let id = self.next_experiment_id().to_string();
        let dir = self.root.join(&id);
        fs::create_dir_all(&dir).context("creating experiment directory", PipelineError::Tracking)?;
        let meta = ExperimentMeta {
            experiment_id: id,
            name: name.to_string(),
            artifact_location: absolute_uri(&dir),
            lifecycle_stage: "active".to_string(),
            creation_time: now_millis(),
        };
        write_yaml(&dir.join("meta.yaml"), &meta)?;
        debug!("Created experiment '{}' ({})", meta.name, meta.experiment_id);
        Ok(meta)
    }

    fn read_run_meta(&self, run: &RunHandle) -> Result<RunMeta> {
        let raw = fs::read_to_string(self.run_dir(run).join("meta.yaml"))
            .with_context(PipelineError::Tracking, || format!("run {} not found", run.run_id))?;
        serde_yaml::from_str(&raw).context("parsing run meta", PipelineError::Tracking)
    }
}

impl ExperimentTracker for LocalFileTracker {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    fn supports_registry(&self) -> bool {
        false
    }

    fn start_run(&self, experiment: &str, run_name: &str) -> Result<RunHandle> {
        let experiment = match self.find_experiment(experiment)? {
            Some(meta) => meta,
            None => self.create_experiment(experiment)?,
        };

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_dir = self.root.join(&experiment.experiment_id).join(&run_id);
        for sub in ["artifacts", "metrics", "params", "tags"] {
            fs::create_dir_all(run_dir.join(sub)).context("creating run directory", PipelineError::Tracking)?;
        }

        let artifact_uri = absolute_uri(&run_dir.join("artifacts"));
        let meta = RunMeta {
            run_id: run_id.clone(),
            run_uuid: run_id.clone(),
            run_name: run_name.to_string(),
            experiment_id: experiment.experiment_id.clone(),
            artifact_uri: artifact_uri.clone(),
            lifecycle_stage: "active".to_string(),
            status: 1,
            start_time: now_millis(),
            end_time: None,
            user_id: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        };
        write_yaml(&run_dir.join("meta.yaml"), &meta)?;
        fs::write(run_dir.join("tags").join("mlflow.runName"), run_name)
            .context("writing run tag", PipelineError::Tracking)?;

        Ok(RunHandle {
            experiment_id: experiment.experiment_id,
            run_id,
            artifact_uri,
        })
    }

    fn log_params(&self, run: &RunHandle, params: &BTreeMap<String, String>) -> Result<()> {
        let dir = self.run_dir(run).join("params");
        for (key, value) in params {
            fs::write(dir.join(sanitize_key(key)), value)
                .with_context(PipelineError::Tracking, || format!("writing param {}", key))?;
        }
        Ok(())
    }

    fn log_metrics(&self, run: &RunHandle, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let dir = self.run_dir(run).join("metrics");
        let timestamp = now_millis();
        for (key, value) in metrics {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(sanitize_key(key)))
                .with_context(PipelineError::Tracking, || format!("opening metric {}", key))?;
            writeln!(file, "{} {} 0", timestamp, value)
                .with_context(PipelineError::Tracking, || format!("writing metric {}", key))?;
        }
        Ok(())
    }

    fn log_artifact(&self, run: &RunHandle, local: &Path, artifact_path: &str) -> Result<()> {
        let file_name = local
            .file_name()
            .with_context(PipelineError::Tracking, || format!("{} is not a file", local.display()))?;
        let target_dir = self
            .run_dir(run)
            .join("artifacts")
            .join(artifact_path.trim_matches('/'));
        fs::create_dir_all(&target_dir).context("creating artifact directory", PipelineError::Tracking)?;
        fs::copy(local, target_dir.join(file_name))
            .with_context(PipelineError::Tracking, || format!("copying artifact {}", local.display()))?;
        Ok(())
    }

    fn register_model(&self, _run: &RunHandle, name: &str, _artifact_path: &str) -> Result<String> {
        Err(PipelineError::Tracking(format!(
            "cannot register '{}': the file store has no model registry",
            name
        )))
    }

    fn end_run(&self, run: &RunHandle, status: RunStatus) -> Result<()> {
        let mut meta = self.read_run_meta(run)?;
        meta.status = match status {
            RunStatus::Finished => 3,
            RunStatus::Failed => 4,
        };
        meta.end_time = Some(now_millis());
        write_yaml(&self.run_dir(run).join("meta.yaml"), &meta)
    }
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(value).context("serializing meta", PipelineError::Tracking)?;
    fs::write(path, yaml).with_context(PipelineError::Tracking, || format!("writing {}", path.display()))
}

fn absolute_uri(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

/// Keys become file names; keep them on one path level
fn sanitize_key(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("EPOCHS".to_string(), "1".to_string()),
            ("IMAGE_SIZE".to_string(), "[224, 224, 3]".to_string()),
        ])
    }

    #[test]
    fn test_run_layout() {
        let dir = tempdir().unwrap();
        let tracker = LocalFileTracker::new(dir.path());

        let run = tracker.start_run("chest-cancer", "evaluation").unwrap();
        tracker.log_params(&run, &params()).unwrap();
        tracker
            .log_metrics(&run, &BTreeMap::from([("accuracy".to_string(), 0.75)]))
            .unwrap();
        tracker.end_run(&run, RunStatus::Finished).unwrap();

        let run_dir = dir.path().join(&run.experiment_id).join(&run.run_id);
        assert_eq!(fs::read_to_string(run_dir.join("params/EPOCHS")).unwrap(), "1");
        let metric = fs::read_to_string(run_dir.join("metrics/accuracy")).unwrap();
        let fields: Vec<&str> = metric.trim().split(' ').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1], "0.75");

        let meta: RunMeta =
            serde_yaml::from_str(&fs::read_to_string(run_dir.join("meta.yaml")).unwrap()).unwrap();
        assert_eq!(meta.status, 3);
        assert!(meta.end_time.is_some());
    }

    #[test]
    fn test_experiment_reused_by_name() {
        let dir = tempdir().unwrap();
        let tracker = LocalFileTracker::new(dir.path());
        let first = tracker.start_run("exp", "a").unwrap();
        let second = tracker.start_run("exp", "b").unwrap();
        let other = tracker.start_run("other", "c").unwrap();

        assert_eq!(first.experiment_id, second.experiment_id);
        assert_ne!(first.run_id, second.run_id);
        assert_ne!(first.experiment_id, other.experiment_id);
    }

    #[test]
    fn test_artifact_copied() {
        let dir = tempdir().unwrap();
        let tracker = LocalFileTracker::new(dir.path().join("mlruns"));
        let local = dir.path().join("model.mpk");
        fs::write(&local, b"weights").unwrap();

        let run = tracker.start_run("exp", "eval").unwrap();
        tracker.log_artifact(&run, &local, "model").unwrap();

        let copied = dir
            .path()
            .join("mlruns")
            .join(&run.experiment_id)
            .join(&run.run_id)
            .join("artifacts/model/model.mpk");
        assert_eq!(fs::read(copied).unwrap(), b"weights");
    }

    #[test]
    fn test_registry_unsupported() {
        let dir = tempdir().unwrap();
        let tracker = LocalFileTracker::new(dir.path());
        let run = tracker.start_run("exp", "eval").unwrap();
        let err = tracker.register_model(&run, "VGG16Model", "model").unwrap_err();
        assert!(!err.is_fatal());
    }
}
