//! Disposition of messages whose processing failed

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::DeadLetterPolicy;
use crate::error::PublishError;
use crate::messaging::{
    Message, Publisher, FAILURE_REASON_HEADER, ORIGINAL_TOPIC_HEADER, REDELIVERED_HEADER,
};
use crate::metrics::WorkerMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    Dropped,
    Requeued,
    /// A message that was already redelivered once failed again
    DroppedAfterRedelivery,
    Published { topic: String },
    PublishFailed(PublishError),
}

pub struct DeadLetterRouter {
    policy: DeadLetterPolicy,
    publisher: Arc<dyn Publisher>,
    metrics: WorkerMetrics,
}

impl DeadLetterRouter {
    pub fn new(policy: DeadLetterPolicy, publisher: Arc<dyn Publisher>, metrics: WorkerMetrics) -> Self {
        Self {
            policy,
            publisher,
            metrics,
        }
    }

    pub async fn route(&self, message: &Message, reason: &str) -> DeadLetterOutcome {
        self.metrics.record_dead_lettered(self.policy.label());

        let outcome = match &self.policy {
            DeadLetterPolicy::Drop => DeadLetterOutcome::Dropped,
            DeadLetterPolicy::RequeueOnce if message.is_redelivery() => {
                DeadLetterOutcome::DroppedAfterRedelivery
            }
            DeadLetterPolicy::RequeueOnce => {
                let mut headers = message.metadata.clone();
                headers.insert(REDELIVERED_HEADER.to_string(), "1".to_string());
                match self
                    .publisher
                    .publish(&message.topic, message.payload.clone(), &headers)
                    .await
                {
                    Ok(()) => DeadLetterOutcome::Requeued,
                    Err(e) => DeadLetterOutcome::PublishFailed(e),
                }
            }
            DeadLetterPolicy::PublishToTopic(topic) => {
                let mut headers = message.metadata.clone();
                headers.insert(ORIGINAL_TOPIC_HEADER.to_string(), message.topic.clone());
                headers.insert(FAILURE_REASON_HEADER.to_string(), reason.to_string());
                match self
                    .publisher
                    .publish(topic, message.payload.clone(), &headers)
                    .await
                {
                    Ok(()) => DeadLetterOutcome::Published {
                        topic: topic.clone(),
                    },
                    Err(e) => DeadLetterOutcome::PublishFailed(e),
                }
            }
        };

        match &outcome {
            DeadLetterOutcome::PublishFailed(e) => warn!(
                message_id = %message.id,
                topic = %message.topic,
                policy = self.policy.label(),
                error = %e,
                "Dead-letter publish failed, message lost"
            ),
            other => info!(
                message_id = %message.id,
                topic = %message.topic,
                policy = self.policy.label(),
                outcome = ?other,
                reason = %reason,
                "Failed message dead-lettered"
            ),
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Metadata;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Bytes, Metadata)>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            payload: Bytes,
            headers: &Metadata,
        ) -> Result<(), PublishError> {
            self.published
                .lock()
                .push((topic.to_string(), payload, headers.clone()));
            Ok(())
        }
    }

    fn router(policy: DeadLetterPolicy) -> (Arc<RecordingPublisher>, WorkerMetrics, DeadLetterRouter) {
        let publisher = Arc::new(RecordingPublisher::default());
        let metrics = WorkerMetrics::new().unwrap();
        let router = DeadLetterRouter::new(policy, publisher.clone(), metrics.clone());
        (publisher, metrics, router)
    }

    #[tokio::test]
    async fn drop_publishes_nothing() {
        let (publisher, metrics, router) = router(DeadLetterPolicy::Drop);
        let outcome = router.route(&Message::new("orders", "x"), "timeout").await;

        assert_eq!(outcome, DeadLetterOutcome::Dropped);
        assert!(publisher.published.lock().is_empty());
        assert_eq!(metrics.messages_dead_lettered("drop"), 1);
    }

    #[tokio::test]
    async fn requeue_once_marks_redelivery_then_drops() {
        let (publisher, _metrics, router) = router(DeadLetterPolicy::RequeueOnce);
        let message = Message::new("orders", "x");

        assert_eq!(router.route(&message, "boom").await, DeadLetterOutcome::Requeued);
        let (topic, payload, headers) = publisher.published.lock()[0].clone();
        assert_eq!(topic, "orders");
        assert_eq!(payload, Bytes::from_static(b"x"));
        assert_eq!(headers.get(REDELIVERED_HEADER).map(String::as_str), Some("1"));

        let redelivered = message.with_metadata(REDELIVERED_HEADER, "1");
        assert_eq!(
            router.route(&redelivered, "boom").await,
            DeadLetterOutcome::DroppedAfterRedelivery
        );
        assert_eq!(publisher.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn topic_policy_carries_origin_and_reason() {
        let (publisher, _metrics, router) =
            router(DeadLetterPolicy::PublishToTopic("worker.dead_letter".to_string()));

        let outcome = router
            .route(&Message::new("orders", "x"), "invalid input: empty payload")
            .await;

        assert_eq!(
            outcome,
            DeadLetterOutcome::Published {
                topic: "worker.dead_letter".to_string()
            }
        );
        let (topic, _, headers) = publisher.published.lock()[0].clone();
        assert_eq!(topic, "worker.dead_letter");
        assert_eq!(headers[ORIGINAL_TOPIC_HEADER], "orders");
        assert_eq!(headers[FAILURE_REASON_HEADER], "invalid input: empty payload");
    }
}
