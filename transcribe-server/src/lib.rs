//! transcribe-server library interface
//!
//! Exposes the pipeline pieces and the router for integration testing.

pub mod admission;
pub mod api;
pub mod audio;
pub mod context;
pub mod engine;
pub mod error;
pub mod inference;
pub mod ingest;
pub mod logging;
pub mod service;

pub use crate::error::{ApiResult, TranscriptionError};

use axum::{extract::DefaultBodyLimit, Router};
use chrono::{DateTime, Utc};
use transcribe_common::time::now;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::TranscriptionService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TranscriptionService>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: Arc<TranscriptionService>) -> Self {
        Self {
            service,
            startup_time: now(),
        }
    }
}

/// Build application router
///
/// Upload size is enforced by the ingestor while streaming, so axum's
/// default body limit is disabled.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::transcribe_routes())
        .merge(api::health_routes())
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
