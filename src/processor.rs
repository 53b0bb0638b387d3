//! # Work Processor
//!
//! The per-message unit of work. Validates the payload, performs the
//! (simulated) task and returns a [`ProcessingResult`]. Every invocation is
//! counted in `worker_process_total` before any outcome is known and runs
//! inside a `process_work` span.
//!
//! ```rust
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use worker_service::config::ProcessingConfig;
//! use worker_service::messaging::{Message, ProcessingContext};
//! use worker_service::{ProcessingStatus, WorkProcessor, WorkerMetrics};
//!
//! # tokio_test::block_on(async {
//! let config = ProcessingConfig { work_duration_ms: 0, ..Default::default() };
//! let processor = WorkProcessor::new(config, WorkerMetrics::new().unwrap());
//! let context = ProcessingContext::new(CancellationToken::new(), Duration::from_secs(1));
//!
//! let result = processor
//!     .process(&Message::new("api.data.accessed", "{}"), &context)
//!     .await;
//! assert_eq!(result.status, ProcessingStatus::Completed);
//! # });
//! ```

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ProcessingConfig;
use crate::error::HandlerError;
use crate::messaging::{
    FailureReason, Message, Metadata, ProcessingContext, ProcessingResult, Publisher,
    SpanContext, CORRELATION_ID_HEADER, SOURCE_MESSAGE_ID_HEADER,
};
use crate::metrics::WorkerMetrics;
use crate::subscription::MessageHandler;

#[derive(Debug, Clone)]
pub struct WorkProcessor {
    config: ProcessingConfig,
    metrics: WorkerMetrics,
}

impl WorkProcessor {
    pub fn new(config: ProcessingConfig, metrics: WorkerMetrics) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub async fn process(&self, message: &Message, context: &ProcessingContext) -> ProcessingResult {
        self.metrics.record_process_invocation();

        let correlation_id = message.correlation_id();
        let span = info_span!(
            "process_work",
            topic = %message.topic,
            message_id = %message.id,
            correlation_id = %correlation_id,
        );
        let span_context = SpanContext {
            correlation_id,
            span_id: span.id().map(|id| id.into_u64()),
        };

        let started = Instant::now();
        let result = self
            .perform(message, context, span_context)
            .instrument(span)
            .await;
        self.metrics.record_processing_duration(started.elapsed());

        result
    }

    async fn perform(
        &self,
        message: &Message,
        context: &ProcessingContext,
        span_context: SpanContext,
    ) -> ProcessingResult {
        if let Err(detail) = self.validate(&message.payload) {
            warn!(reason = %detail, bytes = message.payload.len(), "Rejecting invalid payload");
            return ProcessingResult::failed(FailureReason::InvalidInput(detail), span_context);
        }

        debug!(work_ms = self.config.work_duration_ms, "Performing work");

        tokio::select! {
            biased;
            _ = context.cancellation.cancelled() => {
                warn!("Work cancelled");
                ProcessingResult::failed(FailureReason::Cancelled, span_context)
            }
            _ = tokio::time::sleep(self.config.work_duration()) => {
                info!("Work completed");
                ProcessingResult::completed(
                    Bytes::from(self.config.completion_payload.clone()),
                    span_context,
                )
            }
            _ = tokio::time::sleep(context.timeout) => {
                warn!(timeout_ms = context.timeout.as_millis() as u64, "Work timed out");
                ProcessingResult::failed(FailureReason::Timeout, span_context)
            }
        }
    }

    /// Fail closed on empty, oversized or (optionally) non UTF-8 payloads
    fn validate(&self, payload: &Bytes) -> Result<(), String> {
        if payload.is_empty() {
            return Err("empty payload".to_string());
        }
        if payload.len() > self.config.max_payload_bytes {
            return Err(format!(
                "payload of {} bytes exceeds limit of {}",
                payload.len(),
                self.config.max_payload_bytes
            ));
        }
        if self.config.require_utf8 && std::str::from_utf8(payload).is_err() {
            return Err("payload is not valid UTF-8".to_string());
        }
        Ok(())
    }

    /// Process `message` and publish a completed result to `outbound`
    ///
    /// A publish failure turns the result into `Failed(Downstream)`.
    pub async fn process_and_publish(
        &self,
        message: &Message,
        context: &ProcessingContext,
        publisher: &dyn Publisher,
        outbound: &str,
    ) -> ProcessingResult {
        let result = self.process(message, context).await;
        if !result.is_completed() {
            return result;
        }

        let mut headers = Metadata::new();
        headers.insert(
            CORRELATION_ID_HEADER.to_string(),
            result.span_context.correlation_id.to_string(),
        );
        headers.insert(SOURCE_MESSAGE_ID_HEADER.to_string(), message.id.to_string());

        match publisher.publish(outbound, result.output.clone(), &headers).await {
            Ok(()) => result,
            Err(e) => {
                warn!(topic = %outbound, message_id = %message.id, error = %e, "Outbound publish failed");
                ProcessingResult::failed(FailureReason::Downstream(e.to_string()), result.span_context)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for WorkProcessor {
    async fn handle(
        &self,
        message: &Message,
        context: &ProcessingContext,
    ) -> Result<ProcessingResult, HandlerError> {
        Ok(self.process(message, context).await)
    }

    fn name(&self) -> &str {
        "work_processor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn processor(work_ms: u64) -> WorkProcessor {
        WorkProcessor::new(
            ProcessingConfig {
                work_duration_ms: work_ms,
                max_payload_bytes: 16,
                ..Default::default()
            },
            WorkerMetrics::new().unwrap(),
        )
    }

    fn context(timeout: Duration) -> ProcessingContext {
        ProcessingContext::new(CancellationToken::new(), timeout)
    }

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, topic: &str, _: Bytes, _: &Metadata) -> Result<(), PublishError> {
            Err(PublishError::NotConnected {
                topic: topic.to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_with_configured_payload() {
        let processor = processor(500);
        let result = processor
            .process(&Message::new("api.data.accessed", "{}"), &context(Duration::from_secs(30)))
            .await;

        assert!(result.is_completed());
        assert_eq!(result.output, Bytes::from_static(b"Work completed"));
        assert_eq!(processor.metrics.process_total(), 1);
    }

    #[tokio::test]
    async fn invalid_payloads_fail_closed_and_still_count() {
        let processor = processor(0);
        let ctx = context(Duration::from_secs(1));

        for payload in [Bytes::new(), Bytes::from(vec![b'a'; 17]), Bytes::from_static(&[0xff, 0xfe])] {
            let result = processor.process(&Message::new("t", payload), &ctx).await;
            assert!(matches!(result.reason, Some(FailureReason::InvalidInput(_))));
        }
        assert_eq!(processor.metrics.process_total(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_shorter_than_work_fails() {
        let result = processor(500)
            .process(&Message::new("t", "x"), &context(Duration::from_millis(100)))
            .await;
        assert_eq!(result.reason, Some(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn cancellation_is_observed() {
        let token = CancellationToken::new();
        token.cancel();
        let result = processor(500)
            .process(
                &Message::new("t", "x"),
                &ProcessingContext::new(token, Duration::from_secs(30)),
            )
            .await;
        assert_eq!(result.reason, Some(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn publish_failure_becomes_downstream_failure() {
        let result = processor(0)
            .process_and_publish(
                &Message::new("t", "x"),
                &context(Duration::from_secs(1)),
                &FailingPublisher,
                "worker.processed",
            )
            .await;
        assert!(matches!(result.reason, Some(FailureReason::Downstream(_))));
    }
}
