//! `POST /predict`: multipart image upload, JSON prediction

use axum::extract::{Multipart, State};
use axum::Json;
use tracing::{info, warn};

use chest_cancer_classifier::inference::Prediction;

use super::ApiError;
use crate::state::AppState;

/// Multipart field names accepted for the upload
const UPLOAD_FIELDS: [&str; 2] = ["file", "image"];

pub async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Prediction>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if UPLOAD_FIELDS.contains(&name.as_str()) || (upload.is_none() && field.file_name().is_some()) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("reading upload: {}", e)))?;
            upload = Some(bytes);
            break;
        }
    }

    let bytes = upload.ok_or_else(|| ApiError::bad_request("missing image upload field 'file'"))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("uploaded file is empty"));
    }
    if image::guess_format(&bytes).is_err() {
        return Err(ApiError::bad_request("uploaded file is not a supported image"));
    }

    let prediction = tokio::task::spawn_blocking(move || state.predict(&bytes))
        .await
        .map_err(|e| ApiError::internal(format!("prediction task failed: {}", e)))?
        .map_err(|e| {
            warn!("Prediction failed: {}", e);
            ApiError::from(e)
        })?;

    info!(
        "Predicted {} ({:.3})",
        prediction.class, prediction.confidence
    );
    Ok(Json(prediction))
}
