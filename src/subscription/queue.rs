//! Bounded inbound queue between the receive path and the dispatcher

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::BackpressurePolicy;
use crate::messaging::Delivery;
use crate::metrics::WorkerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full under the `drop` policy
    Dropped,
    /// Shutdown began while waiting for space
    Cancelled,
    /// The dispatcher is gone
    Closed,
}

/// Producer side of the inbound queue
///
/// The connection manager's receive path is the only producer.
#[derive(Debug, Clone)]
pub struct InboundQueue {
    sender: mpsc::Sender<Delivery>,
    policy: BackpressurePolicy,
    metrics: WorkerMetrics,
}

impl InboundQueue {
    pub fn bounded(
        capacity: usize,
        policy: BackpressurePolicy,
        metrics: WorkerMetrics,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                policy,
                metrics,
            },
            receiver,
        )
    }

    /// Messages currently waiting
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub async fn push(&self, delivery: Delivery, shutdown: &CancellationToken) -> PushOutcome {
        let outcome = match self.policy {
            BackpressurePolicy::Block => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => PushOutcome::Cancelled,
                    sent = self.sender.send(delivery) => match sent {
                        Ok(()) => PushOutcome::Queued,
                        Err(_) => PushOutcome::Closed,
                    },
                }
            }
            BackpressurePolicy::Drop => match self.sender.try_send(delivery) {
                Ok(()) => PushOutcome::Queued,
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        topic = %dropped.message.topic,
                        message_id = %dropped.message.id,
                        capacity = self.sender.max_capacity(),
                        "Inbound queue full, dropping message"
                    );
                    self.metrics.record_dropped();
                    PushOutcome::Dropped
                }
                Err(TrySendError::Closed(_)) => PushOutcome::Closed,
            },
        };

        self.metrics.set_queue_depth(self.depth());
        outcome
    }
}
