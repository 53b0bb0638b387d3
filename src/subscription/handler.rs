//! Handler trait and subscription bindings

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::messaging::{Message, ProcessingContext, ProcessingResult};

/// Processes messages delivered on a subscribed topic
///
/// Returning `Ok` with a `Failed` result and returning `Err` are both routed
/// through the dead-letter policy; the distinction only shows up in logs and
/// the `kind` label of `worker_messages_failed_total`. Panics are caught by
/// the subscription loop.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        message: &Message,
        context: &ProcessingContext,
    ) -> Result<ProcessingResult, HandlerError>;

    /// Name used in logs and error messages
    fn name(&self) -> &str;
}

/// Per-subscription overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Maximum concurrent handler invocations for this topic; `Some(1)`
    /// gives FIFO processing
    pub concurrency: Option<usize>,
    /// Where `Completed` output is published; defaults to the outbound topic
    pub result_topic: Option<String>,
}

impl SubscriptionOptions {
    pub fn ordered() -> Self {
        Self {
            concurrency: Some(1),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_result_topic(mut self, topic: impl Into<String>) -> Self {
        self.result_topic = Some(topic.into());
        self
    }
}

/// A topic bound to its handler; immutable once registered
#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub handler: Arc<dyn MessageHandler>,
    pub concurrency: usize,
    pub result_topic: String,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("handler", &self.handler.name())
            .field("concurrency", &self.concurrency)
            .field("result_topic", &self.result_topic)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown panic".to_string()
    }
}
