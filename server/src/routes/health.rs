use axum::extract::State;
use axum::Json;
use serde::Serialize;

use chest_cancer_classifier::backend::backend_name;
use chest_cancer_classifier::model::store;
use chest_cancer_classifier::VERSION;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub backend: &'static str,
    /// A trained model exists on disk
    pub model_available: bool,
    /// The model is cached in memory
    pub model_loaded: bool,
    pub training: bool,
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: VERSION,
        backend: backend_name(),
        model_available: store::model_exists(&state.config().model_path),
        model_loaded: state.model_loaded(),
        training: state.is_training(),
    })
}
