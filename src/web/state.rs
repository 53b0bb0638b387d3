//! Worker Web Application State

use std::sync::Arc;

use crate::config::WebConfig;
use crate::service::WorkerService;

/// Shared state for every HTTP handler
#[derive(Debug, Clone)]
pub struct WorkerWebState {
    pub service: Arc<WorkerService>,
    pub config: WebConfig,
}

impl WorkerWebState {
    pub fn new(service: Arc<WorkerService>) -> Self {
        let config = service.config().web.clone();
        Self { service, config }
    }
}
