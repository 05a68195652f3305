//! Operator job control: generate, start, stop, destroy and cost reads.

use axum::{
    Json,
    extract::{Query, State, rejection::{JsonRejection, QueryRejection}},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use bitor_core::cost::CurrentCost;

use crate::handlers::{ScanIdRequest, parse_scan_id};
use crate::infra::app_state::AppState;
use crate::infra::errors::AppResult;

pub async fn generate_scan_handler(
    State(state): State<AppState>,
    body: Result<Json<ScanIdRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = parse_scan_id(&request.scan_id)?;
    info!(job_id = %id, "generate requested");

    let job = state.controller.generate(id).await?;
    Ok(Json(json!({
        "status": "Scan Code Generated",
        "scan_status": job.status,
    })))
}

/// Generates and deploys; responds once the deploy playbook has exited.
pub async fn start_scan_handler(
    State(state): State<AppState>,
    body: Result<Json<ScanIdRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = parse_scan_id(&request.scan_id)?;
    info!(job_id = %id, "start requested");

    let job = state.controller.start(id).await?;
    Ok(Json(json!({
        "status": "Scan started",
        "scan_status": job.status,
    })))
}

pub async fn start_scan_async_handler(
    State(state): State<AppState>,
    body: Result<Json<ScanIdRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = parse_scan_id(&request.scan_id)?;

    let progress_id = state.controller.start_async(id).await?;
    info!(job_id = %id, %progress_id, "start accepted");
    Ok(Json(json!({
        "status": "Scan accepted",
        "progress_id": progress_id,
    })))
}

pub async fn stop_scan_handler(
    State(state): State<AppState>,
    body: Result<Json<ScanIdRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = parse_scan_id(&request.scan_id)?;
    info!(job_id = %id, "stop requested");

    let job = state.controller.stop(id).await?;
    Ok(Json(json!({
        "status": "Scan stopped",
        "cost": job.cost,
    })))
}

pub async fn destroy_scan_handler(
    State(state): State<AppState>,
    body: Result<Json<ScanIdRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = parse_scan_id(&request.scan_id)?;
    info!(job_id = %id, "destroy requested");

    let job = state.controller.destroy(id).await?;
    Ok(Json(json!({
        "status": "Scan destruction completed successfully",
        "scan_status": job.status,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CostQuery {
    #[serde(default)]
    pub scan_id: String,
}

pub async fn current_cost_handler(
    State(state): State<AppState>,
    query: Result<Query<CostQuery>, QueryRejection>,
) -> AppResult<Json<CurrentCost>> {
    let Query(query) = query?;
    let id = parse_scan_id(&query.scan_id)?;
    Ok(Json(state.controller.current_cost(id).await?))
}
