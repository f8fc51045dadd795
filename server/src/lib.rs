//! Web front end for the chest CT scan classifier
//!
//! - `GET /` upload form
//! - `POST /predict` classify an uploaded image
//! - `POST /train`, `GET /train/status`, `POST /train/stop` background retraining
//! - `GET /health`

pub mod routes;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::{AppState, ServerConfig};

/// Largest accepted upload
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

pub const DEFAULT_PORT: u16 = 8080;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::home::index))
        .route("/predict", post(routes::predict::predict))
        .route("/train", post(routes::training::start))
        .route("/train/status", get(routes::training::status))
        .route("/train/stop", post(routes::training::stop))
        .route("/health", get(routes::health::health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
