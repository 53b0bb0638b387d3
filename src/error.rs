//! # Worker Error Types
//!
//! Error taxonomy for the worker service. Each layer owns its own enum and the
//! crate-level [`WorkerError`] wraps them with `#[from]` conversions.
//!
//! | Error                 | Recovery                                          |
//! |-----------------------|---------------------------------------------------|
//! | [`ConnectionError`]   | retried locally with exponential backoff          |
//! | [`PublishError`]      | retried once, then health is marked degraded      |
//! | [`HandlerError`]      | isolated to one message, routed to dead-letter    |
//! | [`ConfigurationError`]| fatal at startup, before any subscription         |

use std::time::Duration;
use thiserror::Error;

pub use crate::config::ConfigurationError;
pub use crate::messaging::MessagingError;

/// Transport-level failures while establishing a broker session
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {address}: {message}")]
    Transport { address: String, message: String },

    #[error("Connection to {address} timed out after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("Gave up connecting to {address} after {attempts} attempts")]
    AttemptsExhausted { address: String, attempts: u32 },

    #[error("Connection manager is shutting down")]
    ShuttingDown,
}

impl ConnectionError {
    pub fn transport(address: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            address: address.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(address: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            address: address.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Failures publishing to the broker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("No broker session available for publish to {topic}")]
    NotConnected { topic: String },

    #[error("Publish to {topic} failed after {attempts} attempts: {message}")]
    Failed {
        topic: String,
        attempts: u32,
        message: String,
    },
}

/// Per-message handler failures; never fatal to the subscription loop
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Handler {handler} failed: {message}")]
    Failed { handler: String, message: String },

    #[error("Handler {handler} timed out after {timeout_ms}ms")]
    Timeout { handler: String, timeout_ms: u64 },

    #[error("Handler {handler} panicked: {message}")]
    Panicked { handler: String, message: String },
}

impl HandlerError {
    pub fn failed(handler: impl Into<String>, message: impl ToString) -> Self {
        Self::Failed {
            handler: handler.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-readable label used in metrics and dead-letter headers
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "handler_error",
            Self::Timeout { .. } => "timeout",
            Self::Panicked { .. } => "panic",
        }
    }
}

/// Crate-level error type
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("Topic {topic} is already registered")]
    DuplicateSubscription { topic: String },

    #[error("Subscriptions cannot be registered after the loop has started (topic {topic})")]
    RegistrationClosed { topic: String },

    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Subscription loop has already been started")]
    AlreadyStarted,

    #[error("Loop task {task} failed: {message}")]
    LoopTask { task: String, message: String },

    #[error("Worker is shutting down")]
    ShutdownInProgress,

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias for WorkerError
pub type Result<T> = std::result::Result<T, WorkerError>;
