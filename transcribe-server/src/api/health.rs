//! Health and admission status endpoints

use axum::{extract::State, routing::get, Json, Router};
use transcribe_common::api::{HealthResponse, StatusResponse};
use transcribe_common::time::seconds_since;

use crate::AppState;

/// GET /health
///
/// Always 200; `status` is `degraded` until the engine has warmed up.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine_ready = state.service.engine_ready();
    Json(HealthResponse {
        status: if engine_ready { "ok" } else { "degraded" }.to_string(),
        module: "transcribe".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: seconds_since(state.startup_time),
        engine: state.service.engine_name().to_string(),
        engine_ready,
    })
}

/// GET /status
///
/// Admission counters and terminal-state totals since startup.
pub async fn admission_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.service.status())
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(admission_status))
}
