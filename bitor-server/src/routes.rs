use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::handlers::{archive, callbacks, import, progress, scan};
use crate::infra::app_state::AppState;
use crate::infra::auth::require_api_token;

/// Operator endpoints, behind the API token.
fn job_control_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/generate", post(scan::generate_scan_handler))
        .route("/start", post(scan::start_scan_handler))
        .route("/start-async", post(scan::start_scan_async_handler))
        .route("/stop", post(scan::stop_scan_handler))
        .route("/destroy", post(scan::destroy_scan_handler))
        .route("/current-cost", get(scan::current_cost_handler))
        .route(
            "/import-scan-results",
            post(import::import_scan_results_handler),
        )
        .route("/progress/{id}", get(progress::get_progress_handler))
        .route("/signed-url", post(archive::signed_url_handler))
        .route_layer(middleware::from_fn_with_state(state, require_api_token))
}

/// Workload endpoints; each handler checks the job's own secret.
fn callback_routes() -> Router<AppState> {
    Router::new()
        .route("/update-status", post(callbacks::update_status_handler))
        .route("/update-logs", post(callbacks::update_logs_handler))
        .route(
            "/update-skipped-hosts",
            post(callbacks::update_skipped_hosts_handler),
        )
        .route("/update-vm-times", post(callbacks::update_vm_times_handler))
        .route(
            "/update-nuclei-times",
            post(callbacks::update_nuclei_times_handler),
        )
        .route("/update-ip", post(callbacks::update_ip_handler))
        .route("/update-cost", post(callbacks::update_cost_handler))
        .route("/update-archives", post(callbacks::update_archives_handler))
        .route("/scan-complete", post(callbacks::scan_complete_handler))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub fn create_router(state: AppState) -> Router {
    let scan_routes = job_control_routes(state.clone()).merge(callback_routes());

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/scan", scan_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
