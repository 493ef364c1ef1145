//! Route Configuration
//!
//! Configures all HTTP routes for the gateway.

use axum::{response::IntoResponse, routing::get, Router};

use super::handlers;
use crate::infrastructure::metrics;
use crate::presentation::websocket::ws_handler;
use crate::startup::AppState;

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // WebSocket gateway endpoint
        .route("/gateway", get(ws_handler))
        // Health check endpoints
        .route("/health", get(handlers::health_check))
        .route("/health/live", get(handlers::liveness))
        .route("/health/ready", get(handlers::readiness))
        // Operational statistics
        .route("/stats", get(handlers::stats))
        // Prometheus metrics endpoint
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Prometheus metrics endpoint handler
async fn metrics_handler() -> impl IntoResponse {
    let metrics = metrics::gather_metrics();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics,
    )
}
