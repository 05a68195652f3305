use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};

use bitor_core::domain::ArtifactClass;

use crate::handlers::parse_scan_id;
use crate::infra::app_state::AppState;
use crate::infra::errors::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct SignedUrlRequest {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub file_type: String,
}

fn artifact_class(file_type: &str) -> AppResult<ArtifactClass> {
    match file_type.trim() {
        "" => Err(AppError::bad_request("file_type is required")),
        "full" => Ok(ArtifactClass::Full),
        "small" => Ok(ArtifactClass::Small),
        _ => Err(AppError::bad_request("Invalid file type")),
    }
}

/// Signed download link for the newest archive of a scan.
pub async fn signed_url_handler(
    State(state): State<AppState>,
    body: Result<Json<SignedUrlRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = parse_scan_id(&request.scan_id)?;
    let class = artifact_class(&request.file_type)?;

    let download = state.controller.resolve_archive_download(id, class).await?;
    let signed_url = state.presigner.presign(&download).await.map_err(|err| {
        error!(job_id = %id, "{err}");
        AppError::internal("Failed to generate signed URL")
    })?;

    info!(job_id = %id, ?class, "generated signed archive URL");
    Ok(Json(json!({ "signedUrl": signed_url })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_selects_the_archive() {
        assert_eq!(artifact_class("full").expect("full"), ArtifactClass::Full);
        assert_eq!(artifact_class("small").expect("small"), ArtifactClass::Small);
        assert_eq!(
            artifact_class("").expect_err("empty").message,
            "file_type is required"
        );
        assert!(artifact_class("medium").is_err());
    }
}
