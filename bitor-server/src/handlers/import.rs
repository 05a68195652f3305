use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde_json::{Value, json};
use tracing::info;

use bitor_core::lifecycle::ImportRequest;

use crate::infra::app_state::AppState;
use crate::infra::errors::AppResult;

/// Accepts externally produced findings; processing continues in the
/// background and is tracked through the returned progress id.
pub async fn import_scan_results_handler(
    State(state): State<AppState>,
    body: Result<Json<ImportRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let receipt = state.controller.import_results(request).await?;
    info!(
        job_id = %receipt.scan_id,
        findings = receipt.findings,
        "scan results import accepted"
    );
    Ok(Json(json!({
        "status": "File processed successfully",
        "scan_id": receipt.scan_id,
        "progress_id": receipt.progress_id,
        "findings": receipt.findings,
    })))
}
