//! # Worker Service
//!
//! Explicitly constructed owner of every component. There is no global
//! client or registry: the binary builds one [`WorkerService`], the web layer
//! receives it as an `Arc`, and tests build as many as they like.
//!
//! ```text
//! WorkerService
//!  ├── ConnectionManager ──▶ HealthReporter
//!  ├── SubscriptionLoop  ──▶ ConnectionManager (receive path, publish)
//!  ├── WorkProcessor
//!  └── WorkerMetrics
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BrokerProvider, WorkerConfig};
use crate::connection::{ConnectionManager, ShutdownReport};
use crate::error::Result;
use crate::health::HealthReporter;
use crate::messaging::{
    BrokerTransport, FailureReason, InMemoryBroker, Message, NatsTransport, ProcessingContext,
    ProcessingResult, SpanContext,
};
use crate::metrics::WorkerMetrics;
use crate::processor::WorkProcessor;
use crate::subscription::{LoopHandle, MessageHandler, SubscriptionLoop, SubscriptionOptions};

/// Payload of messages synthesized by [`WorkerService::process_once`]
pub const MANUAL_TRIGGER_PAYLOAD: &str = r#"{"trigger":"http"}"#;

pub struct WorkerService {
    config: WorkerConfig,
    connection: Arc<ConnectionManager>,
    subscriptions: SubscriptionLoop,
    processor: Arc<WorkProcessor>,
    metrics: WorkerMetrics,
    loop_handle: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerService")
            .field("connection", &self.connection)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl WorkerService {
    /// Build a service over an explicit broker transport
    pub fn new(config: WorkerConfig, transport: Arc<dyn BrokerTransport>) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = WorkerMetrics::new()?;
        let connection = ConnectionManager::new(transport, &config.broker, metrics.clone());
        let subscriptions = SubscriptionLoop::new(connection.clone(), config.clone(), metrics.clone());
        let processor = Arc::new(WorkProcessor::new(
            config.processing.clone(),
            metrics.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            connection,
            subscriptions,
            processor,
            metrics,
            loop_handle: Mutex::new(None),
        }))
    }

    /// Build a service with the transport named by `broker.provider`
    pub fn from_config(config: WorkerConfig) -> Result<Arc<Self>> {
        let transport: Arc<dyn BrokerTransport> = match config.broker.provider {
            BrokerProvider::Nats => Arc::new(NatsTransport::new(config.broker.client_name.clone())),
            BrokerProvider::InMemory => Arc::new(InMemoryBroker::new()),
        };
        Self::new(config, transport)
    }

    pub fn register(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.subscriptions.register(topic, handler)
    }

    pub fn register_with(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscriptionOptions,
    ) -> Result<()> {
        self.subscriptions.register_with(topic, handler, options)
    }

    /// Bind the inbound topic to the work processor
    pub fn register_default_subscription(&self) -> Result<()> {
        let topic = self.config.topics.inbound.clone();
        self.subscriptions.register(&topic, self.processor.clone())
    }

    /// Close registration and start the supervised loop
    pub fn start(&self) -> Result<()> {
        let handle = self.subscriptions.start()?;
        *self.loop_handle.lock() = Some(handle);
        info!(
            provider = ?self.config.broker.provider,
            topics = ?self.subscriptions.topics(),
            "Worker service started"
        );
        Ok(())
    }

    /// One manual processor invocation plus outbound publish
    ///
    /// Used by `GET /process`. Tracked like a subscription handler, so
    /// shutdown waits for it. Processing and publish together are bounded by
    /// `processing.timeout_ms`; running over yields `Failed(Timeout)`.
    pub async fn process_once(&self) -> (Uuid, ProcessingResult) {
        let message = Message::new(self.config.topics.inbound.clone(), MANUAL_TRIGGER_PAYLOAD);
        let message_id = message.id;
        let correlation_id = message.correlation_id();
        let timeout = self.config.processing.timeout();
        let context = ProcessingContext::new(self.connection.cancellation_token(), timeout);

        let processor = self.processor.clone();
        let connection = self.connection.clone();
        let outbound = self.config.topics.outbound.clone();
        let work = self.connection.tracker().track_future(async move {
            processor
                .process_and_publish(&message, &context, connection.as_ref(), &outbound)
                .await
        });

        let result = match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    message_id = %message_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Manual processing timed out"
                );
                ProcessingResult::failed(FailureReason::Timeout, SpanContext::detached(correlation_id))
            }
        };

        (message_id, result)
    }

    /// Drain in-flight work, close the broker session and stop the loop
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let report = self.connection.shutdown(deadline).await;

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), handle.join())
                .await
                .is_err()
            {
                warn!("Loop tasks did not stop after shutdown");
            }
        }

        info!(
            graceful = report.graceful,
            abandoned = report.in_flight_at_deadline,
            processed = self.metrics.process_total(),
            "Worker service stopped"
        );
        report
    }

    pub fn health(&self) -> Arc<HealthReporter> {
        self.connection.health()
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn processor(&self) -> &Arc<WorkProcessor> {
        &self.processor
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.topics()
    }
}
