//! MLflow tracking server client (REST API 2.0)
//!
//! Works against a self-hosted `mlflow server` or a hosted endpoint such as
//! DagsHub. Artifacts are uploaded through the server's artifact proxy, so
//! runs must use an `mlflow-artifacts:` artifact root.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::{now_millis, ExperimentTracker, RunHandle, RunStatus};
use crate::utils::error::{PipelineError, Result, ResultExt};

const API_PREFIX: &str = "api/2.0/mlflow";
const ARTIFACTS_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts";
const PROXY_SCHEME: &str = "mlflow-artifacts:";
/// Server-side limit on a single log-batch request
const MAX_PARAMS_PER_BATCH: usize = 100;

/// Credentials read from the standard MLflow environment variables
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            username: var("MLFLOW_TRACKING_USERNAME"),
            password: var("MLFLOW_TRACKING_PASSWORD"),
            token: var("MLFLOW_TRACKING_TOKEN"),
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token)
        } else if let Some(user) = &self.username {
            request.basic_auth(user, self.password.as_deref())
        } else {
            request
        }
    }
}

/// Error body returned by the server
#[derive(Debug, Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
enum ApiError {
    Status { status: u16, code: String, message: String },
    Transport(String),
}

impl ApiError {
    fn code(&self) -> Option<&str> {
        match self {
            ApiError::Status { code, .. } => Some(code),
            ApiError::Transport(_) => None,
        }
    }

    fn into_tracking(self, action: &str) -> PipelineError {
        match self {
            ApiError::Status { status, code, message } => PipelineError::Tracking(format!(
                "{} failed with HTTP {} {}: {}",
                action, status, code, message
            )),
            ApiError::Transport(msg) => PipelineError::Tracking(format!("{} failed: {}", action, msg)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Experiment {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: Experiment,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct ModelVersion {
    version: String,
}

#[derive(Debug, Deserialize)]
struct CreateModelVersionResponse {
    model_version: ModelVersion,
}

#[derive(Debug, Serialize)]
struct Param<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct Metric<'a> {
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

pub struct MlflowRestTracker {
    base_url: String,
    client: Client,
    credentials: Credentials,
}

impl MlflowRestTracker {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building HTTP client", PipelineError::Tracking)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_PREFIX, path)
    }

    fn send<R: DeserializeOwned>(&self, request: RequestBuilder) -> std::result::Result<R, ApiError> {
        let response = self
            .credentials
            .apply(request)
            .send()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response.text().map_err(|e| ApiError::Transport(e.to_string()))?;
        if !status.is_success() {
            let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                code: parsed.error_code,
                message: if parsed.message.is_empty() { body } else { parsed.message },
            });
        }
        let body = if body.trim().is_empty() { "{}".to_string() } else { body };
        serde_json::from_str(&body).map_err(|e| ApiError::Transport(format!("unexpected response: {}", e)))
    }

    fn post<R: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> std::result::Result<R, ApiError> {
        self.send(self.client.request(Method::POST, self.endpoint(path)).json(body))
    }

    fn experiment_id(&self, name: &str) -> Result<String> {
        let request = self
            .client
            .get(self.endpoint("experiments/get-by-name"))
            .query(&[("experiment_name", name)]);
        match self.send::<GetExperimentResponse>(request) {
            Ok(found) => return Ok(found.experiment.experiment_id),
            Err(err) if err.code() == Some("RESOURCE_DOES_NOT_EXIST") => {}
            Err(err) => return Err(err.into_tracking("experiment lookup")),
        }

        info!("Creating MLflow experiment '{}'", name);
        let created: CreateExperimentResponse = self
            .post("experiments/create", &json!({ "name": name }))
            .map_err(|e| e.into_tracking("experiment creation"))?;
        Ok(created.experiment_id)
    }
}

/// Path below the artifact proxy for a run artifact
fn proxied_artifact_path(artifact_uri: &str, artifact_path: &str, file_name: &str) -> Result<String> {
    let rest = artifact_uri.strip_prefix(PROXY_SCHEME).ok_or_else(|| {
        PipelineError::Tracking(format!(
            "artifact root '{}' is not served through the tracking server",
            artifact_uri
        ))
    })?;
    let mut parts: Vec<&str> = vec![rest.trim_matches('/')];
    let artifact_path = artifact_path.trim_matches('/');
    if !artifact_path.is_empty() {
        parts.push(artifact_path);
    }
    parts.push(file_name);
    Ok(parts.join("/"))
}

impl ExperimentTracker for MlflowRestTracker {
    fn backend_name(&self) -> &'static str {
        "mlflow"
    }

    fn supports_registry(&self) -> bool {
        true
    }

    fn start_run(&self, experiment: &str, run_name: &str) -> Result<RunHandle> {
        let experiment_id = self.experiment_id(experiment)?;
        let created: CreateRunResponse = self
            .post(
                "runs/create",
                &json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": now_millis(),
                    "tags": [{ "key": "mlflow.runName", "value": run_name }],
                }),
            )
            .map_err(|e| e.into_tracking("run creation"))?;
        debug!("Started MLflow run {}", created.run.info.run_id);
        Ok(RunHandle {
            experiment_id,
            run_id: created.run.info.run_id,
            artifact_uri: created.run.info.artifact_uri,
        })
    }

    fn log_params(&self, run: &RunHandle, params: &BTreeMap<String, String>) -> Result<()> {
        let params: Vec<Param> = params
            .iter()
            .map(|(key, value)| Param { key, value })
            .collect();
        for chunk in params.chunks(MAX_PARAMS_PER_BATCH) {
            self.post::<serde_json::Value>(
                "runs/log-batch",
                &json!({ "run_id": run.run_id, "params": chunk }),
            )
            .map_err(|e| e.into_tracking("logging params"))?;
        }
        Ok(())
    }

    fn log_metrics(&self, run: &RunHandle, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let timestamp = now_millis();
        let metrics: Vec<Metric> = metrics
            .iter()
            .map(|(key, value)| Metric { key, value: *value, timestamp, step: 0 })
            .collect();
        self.post::<serde_json::Value>(
            "runs/log-batch",
            &json!({ "run_id": run.run_id, "metrics": metrics }),
        )
        .map_err(|e| e.into_tracking("logging metrics"))?;
        Ok(())
    }

    fn log_artifact(&self, run: &RunHandle, local: &Path, artifact_path: &str) -> Result<()> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(PipelineError::Tracking, || format!("{} is not a file", local.display()))?;
        let path = proxied_artifact_path(&run.artifact_uri, artifact_path, file_name)?;
        let bytes = std::fs::read(local)
            .with_context(PipelineError::Tracking, || format!("reading artifact {}", local.display()))?;

        let url = format!("{}/{}/{}", self.base_url, ARTIFACTS_PREFIX, path);
        let request = self.client.put(url).body(bytes);
        self.send::<serde_json::Value>(request)
            .map_err(|e| e.into_tracking("artifact upload"))?;
        debug!("Uploaded artifact {}", path);
        Ok(())
    }

    fn register_model(&self, run: &RunHandle, name: &str, artifact_path: &str) -> Result<String> {
        match self.post::<serde_json::Value>("registered-models/create", &json!({ "name": name })) {
            Ok(_) => info!("Created registered model '{}'", name),
            Err(err) if err.code() == Some("RESOURCE_ALREADY_EXISTS") => {}
            Err(err) => return Err(err.into_tracking("model registration")),
        }

        let source = format!(
            "{}/{}",
            run.artifact_uri.trim_end_matches('/'),
            artifact_path.trim_matches('/')
        );
        let created: CreateModelVersionResponse = self
            .post(
                "model-versions/create",
                &json!({ "name": name, "source": source, "run_id": run.run_id }),
            )
            .map_err(|e| e.into_tracking("model version creation"))?;
        Ok(created.model_version.version)
    }

    fn end_run(&self, run: &RunHandle, status: RunStatus) -> Result<()> {
        self.post::<serde_json::Value>(
            "runs/update",
            &json!({
                "run_id": run.run_id,
                "status": status.as_str(),
                "end_time": now_millis(),
            }),
        )
        .map_err(|e| e.into_tracking("closing run"))?;
        Ok(())
    }
}
