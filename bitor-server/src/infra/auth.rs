//! Bearer authorization for the two caller classes: operators holding the
//! API token, and scan workloads holding their job's ephemeral secret.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use constant_time_eq::constant_time_eq;
use tracing::warn;

use bitor_core::domain::JobId;

use crate::infra::app_state::AppState;
use crate::infra::errors::{AppError, AppResult};

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Guards job-control routes with the configured API token.
pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| AppError::unauthorized("Authentication required"))?;
    if !constant_time_eq(token.as_bytes(), state.config.api_token.as_bytes()) {
        warn!(path = %request.uri().path(), "rejected API token");
        return Err(AppError::unauthorized("Invalid API token"));
    }
    Ok(next.run(request).await)
}

/// Checks a workload callback against the job's ephemeral secret. The job
/// id travels in the body, so handlers call this after parsing it.
pub async fn authorize_callback(
    state: &AppState,
    headers: &HeaderMap,
    id: JobId,
) -> AppResult<()> {
    let token = bearer_token(headers)
        .ok_or_else(|| AppError::unauthorized("Authentication required"))?;
    if state.controller.verify_callback_token(id, token).await? {
        Ok(())
    } else {
        warn!(job_id = %id, "rejected callback token");
        Err(AppError::unauthorized("Invalid callback token"))
    }
}
