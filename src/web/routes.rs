//! Worker Web API Routes

use axum::{routing::get, Router};
use std::sync::Arc;

use crate::web::{handlers, state::WorkerWebState};

/// Health check routes for monitoring and Kubernetes probes
pub fn health_routes() -> Router<Arc<WorkerWebState>> {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/live", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route(
            "/health/detailed",
            get(handlers::health::detailed_health_check),
        )
}

/// Metrics routes for Prometheus
pub fn metrics_routes() -> Router<Arc<WorkerWebState>> {
    Router::new().route("/metrics", get(handlers::metrics::prometheus_metrics))
}

pub fn work_routes() -> Router<Arc<WorkerWebState>> {
    Router::new().route("/process", get(handlers::process::process_work))
}
