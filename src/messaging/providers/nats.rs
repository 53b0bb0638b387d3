//! # NATS Provider
//!
//! Core NATS publish/subscribe over `async-nats`. A publish is considered
//! acknowledged once the client has flushed it to the server.
//!
//! The client's own reconnect loop is capped at a single attempt and is not
//! relied on: the first `Disconnected` (or `Closed`) event marks the session
//! lost and the connection manager replaces it, applying its own backoff and
//! resubscribing. Closing a session drains the client so the stale
//! connection does not linger in the background.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::messaging::message::{Message, Metadata};
use crate::messaging::transport::{BrokerSession, BrokerTransport, MessageStream};
use crate::messaging::MessagingError;

/// Creates NATS sessions
#[derive(Debug, Clone)]
pub struct NatsTransport {
    client_name: String,
}

impl NatsTransport {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }
}

#[async_trait]
impl BrokerTransport for NatsTransport {
    async fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn BrokerSession>, MessagingError> {
        let (lost_tx, lost_rx) = watch::channel(false);
        let lost_tx = Arc::new(lost_tx);

        let options = async_nats::ConnectOptions::new()
            .name(&self.client_name)
            .connection_timeout(timeout)
            .max_reconnects(Some(1))
            .event_callback(move |event| {
                let lost_tx = lost_tx.clone();
                async move {
                    match event {
                        async_nats::Event::Disconnected | async_nats::Event::Closed => {
                            warn!(event = %event, "NATS connection lost");
                            lost_tx.send_replace(true);
                        }
                        async_nats::Event::Connected => debug!("NATS connection established"),
                        other => debug!(event = ?other, "NATS client event"),
                    }
                }
            });

        let client = options
            .connect(address)
            .await
            .map_err(MessagingError::connection)?;

        info!(client_name = %self.client_name, "Connected to NATS");

        Ok(Arc::new(NatsSession {
            client,
            lost: lost_rx,
        }))
    }

    fn provider_name(&self) -> &'static str {
        "nats"
    }
}

struct NatsSession {
    client: async_nats::Client,
    lost: watch::Receiver<bool>,
}

impl NatsSession {
    fn to_header_map(headers: &Metadata) -> async_nats::HeaderMap {
        let mut map = async_nats::HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.as_str(), value.as_str());
        }
        map
    }

    fn to_message(message: async_nats::Message) -> Message {
        let mut converted = Message::new(message.subject.to_string(), message.payload);
        converted.reply_to = message.reply.map(|reply| reply.to_string());
        if let Some(headers) = message.headers {
            for (name, values) in headers.iter() {
                if let Some(value) = values.first() {
                    converted
                        .metadata
                        .insert(name.to_string(), value.as_str().to_string());
                }
            }
        }
        converted
    }
}

#[async_trait]
impl BrokerSession for NatsSession {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), MessagingError> {
        if headers.is_empty() {
            self.client
                .publish(topic.to_string(), payload)
                .await
                .map_err(|e| MessagingError::publish(topic, e))?;
        } else {
            self.client
                .publish_with_headers(topic.to_string(), Self::to_header_map(headers), payload)
                .await
                .map_err(|e| MessagingError::publish(topic, e))?;
        }

        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::publish(topic, e))
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, MessagingError> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| MessagingError::subscribe(topic, e))?;

        Ok(subscriber.map(Self::to_message).boxed())
    }

    async fn closed(&self) {
        let mut lost = self.lost.clone();
        // An Err means the client (and its callback) is gone: also closed.
        let _ = lost.wait_for(|lost| *lost).await;
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.client
            .drain()
            .await
            .map_err(MessagingError::connection)
    }
}
