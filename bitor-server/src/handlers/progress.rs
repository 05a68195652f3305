use axum::{
    Json,
    extract::{Path, State},
};

use bitor_core::registry::{JobProgress, ProgressId};

use crate::infra::app_state::AppState;
use crate::infra::errors::{AppError, AppResult};

pub async fn get_progress_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<Json<JobProgress>> {
    let id: ProgressId = raw_id
        .parse()
        .map_err(|_| AppError::bad_request("Invalid progress ID"))?;
    Ok(Json(state.controller.registry().get_progress(id)?))
}
