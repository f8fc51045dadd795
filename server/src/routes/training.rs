//! Background retraining
//!
//! `POST /train` starts the pipeline command as a child process and returns
//! at once; `GET /train/status` polls it and `POST /train/stop` kills it.
//! Only one run may be active at a time.

use std::process::Stdio;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::ApiError;
use crate::state::{AppState, JobStatus, TrainingJob};

pub async fn start(State(state): State<AppState>) -> Result<Response, ApiError> {
    let config = state.config();
    let Some((program, args)) = config.pipeline_command.split_first() else {
        return Err(ApiError::internal("no pipeline command configured"));
    };
    if state.is_training() {
        return Err(ApiError::conflict("a training run is already in progress"));
    }

    let mut child = Command::new(program)
        .args(args)
        .current_dir(&config.project_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ApiError::internal(format!("cannot start '{}': {}", program, e)))?;

    let job = TrainingJob::new(config.pipeline_command.join(" "));
    let (cancel_tx, cancel_rx) = oneshot::channel();
    if let Err(running) = state.begin_job(job.clone(), cancel_tx) {
        let _ = child.start_kill();
        return Err(ApiError::conflict(format!(
            "training run {} is already in progress",
            running.id
        )));
    }
    info!("Training run {} started: {}", job.id, job.command);

    for stream in [
        child.stdout.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
        child.stderr.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
    ]
    .into_iter()
    .flatten()
    {
        tokio::spawn(forward_output(state.clone(), job.id.clone(), stream));
    }
    tokio::spawn(supervise(state.clone(), job.id.clone(), child, cancel_rx));

    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}

pub async fn status(State(state): State<AppState>) -> Response {
    match state.current_job() {
        Some(job) => Json(job).into_response(),
        None => Json(json!({ "status": "idle" })).into_response(),
    }
}

pub async fn stop(State(state): State<AppState>) -> Result<Response, ApiError> {
    if !state.request_cancel() {
        return Err(ApiError::conflict("no training run in progress"));
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "cancelling" }))).into_response())
}

async fn forward_output(state: AppState, id: String, stream: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        state.push_output(&id, line);
    }
}

async fn supervise(state: AppState, id: String, mut child: Child, cancel: oneshot::Receiver<()>) {
    let (status, code) = tokio::select! {
        result = child.wait() => match result {
            Ok(exit) if exit.success() => (JobStatus::Succeeded, exit.code()),
            Ok(exit) => (JobStatus::Failed, exit.code()),
            Err(e) => {
                error!("Waiting for training run {} failed: {}", id, e);
                (JobStatus::Failed, None)
            }
        },
        Ok(()) = cancel => {
            if let Err(e) = child.kill().await {
                warn!("Could not kill training run {}: {}", id, e);
            }
            (JobStatus::Cancelled, None)
        }
    };

    state.finish_job(&id, status, code);
    match status {
        JobStatus::Succeeded => {
            info!("Training run {} finished", id);
            state.invalidate_model();
        }
        other => warn!("Training run {} ended as {:?} (exit code {:?})", id, other, code),
    }
}
