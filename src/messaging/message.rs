//! # Message Structures
//!
//! Inbound messages, processing results and the context handed to handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Header/metadata mapping carried with every message
pub type Metadata = BTreeMap<String, String>;

/// Correlation identifier propagated from inbound to outbound messages
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
/// Set on a message republished by the requeue-once dead-letter policy
pub const REDELIVERED_HEADER: &str = "x-worker-redelivered";
/// Topic a dead-lettered message was originally received on
pub const ORIGINAL_TOPIC_HEADER: &str = "x-worker-original-topic";
/// Why a dead-lettered message failed
pub const FAILURE_REASON_HEADER: &str = "x-worker-failure-reason";
/// Id of the inbound message an outbound message was derived from
pub const SOURCE_MESSAGE_ID_HEADER: &str = "x-worker-source-message-id";

/// A message received from the broker
///
/// Owned by the subscription loop for the duration of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Assigned on receipt; not part of the broker payload
    pub id: Uuid,
    pub topic: String,
    pub payload: Bytes,
    pub metadata: Metadata,
    /// Request/reply subject, when the publisher expects an acknowledgement
    pub reply_to: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            reply_to: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Correlation id from metadata, falling back to the message id
    pub fn correlation_id(&self) -> Uuid {
        self.metadata
            .get(CORRELATION_ID_HEADER)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or(self.id)
    }

    /// Whether this message was already republished once after a failure
    pub fn is_redelivery(&self) -> bool {
        self.metadata.contains_key(REDELIVERED_HEADER)
    }
}

/// A message paired with the subscription it arrived on
///
/// Wildcard subscriptions deliver messages whose topic differs from the
/// subscribed pattern, so dispatch is keyed by `subscription`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: String,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Completed,
    Failed,
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Cancelled,
    InvalidInput(String),
    Downstream(String),
    Handler(String),
}

impl FailureReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidInput(_) => "invalid_input",
            Self::Downstream(_) => "downstream",
            Self::Handler(_) => "handler_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "processing timed out"),
            Self::Cancelled => write!(f, "processing cancelled"),
            Self::InvalidInput(detail) => write!(f, "invalid input: {detail}"),
            Self::Downstream(detail) => write!(f, "downstream failure: {detail}"),
            Self::Handler(detail) => write!(f, "handler failure: {detail}"),
        }
    }
}

/// Trace identifiers for one processing invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    pub correlation_id: Uuid,
    /// `None` when no tracing subscriber recorded the span
    pub span_id: Option<u64>,
}

impl SpanContext {
    pub fn detached(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            span_id: None,
        }
    }
}

/// Outcome of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    pub status: ProcessingStatus,
    pub output: Bytes,
    pub reason: Option<FailureReason>,
    pub span_context: SpanContext,
}

impl ProcessingResult {
    pub fn completed(output: impl Into<Bytes>, span_context: SpanContext) -> Self {
        Self {
            status: ProcessingStatus::Completed,
            output: output.into(),
            reason: None,
            span_context,
        }
    }

    pub fn failed(reason: FailureReason, span_context: SpanContext) -> Self {
        Self {
            status: ProcessingStatus::Failed,
            output: Bytes::new(),
            reason: Some(reason),
            span_context,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }
}

/// Caller-provided limits for one invocation
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    /// Cancelled when the worker begins shutting down
    pub cancellation: CancellationToken,
    pub timeout: Duration,
}

impl ProcessingContext {
    pub fn new(cancellation: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancellation,
            timeout,
        }
    }
}
