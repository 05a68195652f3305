//! Telemetry posted by the scan workload. Every request names its job and
//! carries that job's ephemeral secret as the bearer token.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::HeaderMap,
};
use serde::Deserialize;
use serde_json::{Value, json};

use bitor_core::domain::{JobId, JobStatus};
use bitor_core::lifecycle::ArchiveReport;

use crate::handlers::{ScanIdRequest, parse_scan_id};
use crate::infra::app_state::AppState;
use crate::infra::auth::authorize_callback;
use crate::infra::errors::AppResult;

async fn authorized(
    state: &AppState,
    headers: &HeaderMap,
    raw_id: &str,
) -> AppResult<JobId> {
    let id = parse_scan_id(raw_id)?;
    authorize_callback(state, headers, id).await?;
    Ok(id)
}

fn done(status: &str) -> Json<Value> {
    Json(json!({ "status": status }))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub status: String,
}

pub async fn update_status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<StatusRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;
    let status: JobStatus = request.status.trim().parse()?;

    state.controller.update_status(id, status).await?;
    Ok(done("Scan status updated"))
}

#[derive(Debug, Deserialize)]
pub struct LogsRequest {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub logs_b64: String,
}

pub async fn update_logs_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<LogsRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;

    state.controller.append_remote_log(id, &request.logs_b64).await?;
    Ok(done("Logs updated"))
}

pub async fn update_skipped_hosts_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<LogsRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;

    state
        .controller
        .update_skipped_hosts(id, &request.logs_b64)
        .await?;
    Ok(done("Skipped hosts updated"))
}

#[derive(Debug, Deserialize)]
pub struct TimesRequest {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub stop_time: Option<String>,
}

pub async fn update_vm_times_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TimesRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;

    state
        .controller
        .update_vm_times(id, &request.start_time, request.stop_time.as_deref())
        .await?;
    Ok(done("VM times updated"))
}

pub async fn update_nuclei_times_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TimesRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;

    state
        .controller
        .update_nuclei_times(id, &request.start_time, request.stop_time.as_deref())
        .await?;
    Ok(done("Nuclei times updated"))
}

#[derive(Debug, Deserialize)]
pub struct IpRequest {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub ip_address: String,
}

pub async fn update_ip_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IpRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;

    state.controller.update_ip(id, &request.ip_address).await?;
    Ok(done("Scan IP address updated"))
}

#[derive(Debug, Deserialize)]
pub struct CostRequest {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub vm_size: String,
}

pub async fn update_cost_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CostRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;

    let settled = state
        .controller
        .update_cost(id, &request.start_time, &request.end_time, &request.vm_size)
        .await?;
    Ok(match settled {
        Some(cost) => Json(json!({ "status": "Cost updated", "cost": cost })),
        None => done("Cost already calculated"),
    })
}

#[derive(Debug, Deserialize)]
pub struct ArchivesRequest {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub s3_provider_id: String,
    #[serde(default)]
    pub s3_full_path: String,
    #[serde(default)]
    pub s3_small_path: String,
}

pub async fn update_archives_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ArchivesRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;

    let archive = state
        .controller
        .record_archive(ArchiveReport {
            job_id: id,
            client_id: request.client_id,
            provider_id: request.s3_provider_id,
            full_path: request.s3_full_path,
            small_path: request.s3_small_path,
        })
        .await?;
    Ok(Json(json!({
        "status": "Nuclei scan archives updated",
        "archive_id": archive.id,
    })))
}

/// The workload tore its own compute down.
pub async fn scan_complete_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ScanIdRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body?;
    let id = authorized(&state, &headers, &request.scan_id).await?;

    state.controller.report_external_completion(id).await?;
    Ok(done("Scan removed from monitoring"))
}
