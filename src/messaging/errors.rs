//! # Messaging Error Types
//!
//! Provider-level failures. The connection manager maps these onto
//! [`ConnectionError`](crate::error::ConnectionError) and
//! [`PublishError`](crate::error::PublishError).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Subscribe to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },

    #[error("Broker session is closed")]
    SessionClosed,
}

impl MessagingError {
    /// Create a broker connection error
    pub fn connection(message: impl ToString) -> Self {
        Self::Connection {
            message: message.to_string(),
        }
    }

    /// Create a publish error
    pub fn publish(topic: impl Into<String>, message: impl ToString) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.to_string(),
        }
    }

    /// Create a subscribe error
    pub fn subscribe(topic: impl Into<String>, message: impl ToString) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            message: message.to_string(),
        }
    }
}
