//! Worker Web API Module
//!
//! Health, readiness, metrics and the manual `/process` trigger.

use axum::http::StatusCode;
use axum::Router;
use std::{sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub mod handlers;
pub mod routes;
pub mod state;

pub use state::WorkerWebState;

/// Create the worker web application with all routes and middleware
pub fn create_app(state: Arc<WorkerWebState>) -> Router {
    let common_middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_millis(state.config.request_timeout_ms),
        ));

    let app = Router::new()
        .merge(routes::health_routes())
        .merge(routes::metrics_routes())
        .merge(routes::work_routes())
        .layer(common_middleware)
        .with_state(state);

    info!("Worker web application created");
    app
}
