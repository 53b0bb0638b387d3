//! # Worker Health Check Handlers
//!
//! Kubernetes-compatible probes. Negative answers use 503 so probes and load
//! balancers can act on the status code alone.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::health::HealthSnapshot;
use crate::web::state::WorkerWebState;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: &'static str,
}

/// Basic health check endpoint: GET /health (also GET /health/live)
///
/// Healthy while the supervised loop is alive.
pub async fn health_check(
    State(state): State<Arc<WorkerWebState>>,
) -> (StatusCode, Json<StatusResponse>) {
    if state.service.health().liveness() {
        (StatusCode::OK, Json(StatusResponse { status: "healthy" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse {
                status: "unhealthy",
            }),
        )
    }
}

/// Kubernetes readiness probe: GET /ready (also GET /health/ready)
///
/// Ready once connected to the broker with subscriptions registered.
pub async fn readiness_check(
    State(state): State<Arc<WorkerWebState>>,
) -> (StatusCode, Json<StatusResponse>) {
    if state.service.health().readiness() {
        (StatusCode::OK, Json(StatusResponse { status: "ready" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse {
                status: "not_ready",
            }),
        )
    }
}

/// Comprehensive health check: GET /health/detailed
pub async fn detailed_health_check(
    State(state): State<Arc<WorkerWebState>>,
) -> Json<HealthSnapshot> {
    Json(state.service.health().snapshot())
}
