//! Manual work trigger: GET /process

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::messaging::ProcessingStatus;
use crate::web::state::WorkerWebState;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub status: ProcessingStatus,
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Runs the work processor once and publishes the completion event
///
/// Always 200; a failed run is reported in `status`.
pub async fn process_work(State(state): State<Arc<WorkerWebState>>) -> Json<ProcessResponse> {
    let (message_id, result) = state.service.process_once().await;

    info!(
        message_id = %message_id,
        status = %result.status,
        "Manual processing request handled"
    );

    Json(ProcessResponse {
        status: result.status,
        message_id,
        correlation_id: result.span_context.correlation_id,
        reason: result.reason.map(|reason| reason.to_string()),
    })
}
