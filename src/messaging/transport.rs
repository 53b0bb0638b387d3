//! # Broker Transport Traits
//!
//! Provider-agnostic seam between the connection manager and a concrete
//! message bus. A [`BrokerTransport`] produces [`BrokerSession`]s; a session
//! publishes, subscribes, and reports when the broker has dropped it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use super::message::{Message, Metadata};
use super::MessagingError;
use crate::error::PublishError;

/// Stream of messages for one subscription; ends when the subscription does
pub type MessageStream = BoxStream<'static, Message>;

/// Factory for broker sessions
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Establish a new session; `timeout` bounds the transport handshake
    async fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn BrokerSession>, MessagingError>;

    /// Provider name for logging/metrics
    fn provider_name(&self) -> &'static str;
}

/// One live connection to the broker
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Publish and wait for the broker to acknowledge receipt
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), MessagingError>;

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, MessagingError>;

    /// Resolves once the broker closes or loses this session
    async fn closed(&self);

    /// Close the session; outstanding subscription streams end
    async fn close(&self) -> Result<(), MessagingError>;
}

/// Anything that can publish a payload with retry semantics
///
/// Implemented by the connection manager; the work processor depends on this
/// trait rather than on the manager itself.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), PublishError>;
}
