//! # Worker Metrics Handlers

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, error};

use crate::web::state::WorkerWebState;

/// Prometheus metrics endpoint: GET /metrics
pub async fn prometheus_metrics(State(state): State<Arc<WorkerWebState>>) -> Response {
    debug!("Serving Prometheus metrics");

    match state.service.metrics().render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
