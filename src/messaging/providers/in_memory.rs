//! # In-Memory Broker
//!
//! Process-local publish/subscribe hub for testing and local development.
//!
//! ## Features
//!
//! - **Topic fan-out**: every live subscription on an exact topic receives a copy
//! - **Publish log**: the most recent accepted publishes are kept for assertions
//!   (bounded, oldest evicted first)
//! - **Fault injection**: unreachable broker, failing or slow publishes,
//!   broker-initiated disconnects

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::messaging::message::{Message, Metadata};
use crate::messaging::transport::{BrokerSession, BrokerTransport, MessageStream};
use crate::messaging::MessagingError;

/// Publishes kept by [`InMemoryBroker::new`]
pub const DEFAULT_PUBLISH_LOG_CAPACITY: usize = 10_000;

/// A publish accepted by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub headers: Metadata,
    pub published_at: DateTime<Utc>,
}

struct SessionSubscription {
    session_id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

struct Hub {
    subscriptions: Mutex<HashMap<String, Vec<SessionSubscription>>>,
    sessions: Mutex<HashMap<u64, watch::Sender<bool>>>,
    published: Mutex<VecDeque<PublishedMessage>>,
    log_capacity: usize,
    unreachable: AtomicBool,
    failing_publishes: AtomicU32,
    publish_latency: Mutex<Duration>,
    connect_attempts: AtomicU32,
    next_session_id: AtomicU64,
}

impl Hub {
    fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            published: Mutex::new(VecDeque::new()),
            log_capacity,
            unreachable: AtomicBool::new(false),
            failing_publishes: AtomicU32::new(0),
            publish_latency: Mutex::new(Duration::ZERO),
            connect_attempts: AtomicU32::new(0),
            next_session_id: AtomicU64::new(0),
        }
    }

    fn deliver(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &Metadata,
        reply_to: Option<&str>,
    ) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        let Some(subscribers) = subscriptions.get_mut(topic) else {
            return 0;
        };

        subscribers.retain(|subscription| !subscription.sender.is_closed());
        for subscription in subscribers.iter() {
            let mut message = Message::new(topic, payload.clone());
            message.metadata = headers.clone();
            message.reply_to = reply_to.map(str::to_string);
            let _ = subscription.sender.unbounded_send(message);
        }
        subscribers.len()
    }

    fn record(&self, topic: &str, payload: Bytes, headers: &Metadata) {
        if self.log_capacity == 0 {
            return;
        }
        let mut published = self.published.lock();
        if published.len() == self.log_capacity {
            published.pop_front();
        }
        published.push_back(PublishedMessage {
            topic: topic.to_string(),
            payload,
            headers: headers.clone(),
            published_at: Utc::now(),
        });
    }

    fn drop_session(&self, session_id: u64) {
        if let Some(lost) = self.sessions.lock().remove(&session_id) {
            lost.send_replace(true);
        }
        let mut subscriptions = self.subscriptions.lock();
        for subscribers in subscriptions.values_mut() {
            subscribers.retain(|subscription| subscription.session_id != session_id);
        }
    }
}

/// In-memory broker; clones share the same hub
///
/// # Example
///
/// ```rust
/// use worker_service::messaging::{BrokerTransport, InMemoryBroker, Metadata};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let session = broker.connect("memory://local", Duration::from_secs(1)).await?;
/// session.publish("worker.processed", "done".into(), &Metadata::new()).await?;
/// assert_eq!(broker.published_to("worker.processed").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    hub: Arc<Hub>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("sessions", &self.hub.sessions.lock().len())
            .field("published", &self.hub.published.lock().len())
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_publish_log_capacity(DEFAULT_PUBLISH_LOG_CAPACITY)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` publishes in the log; 0 disables it
    pub fn with_publish_log_capacity(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Hub::with_log_capacity(capacity)),
        }
    }

    /// Refuse (or accept again) new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.hub.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make the next `count` session publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.hub.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Delay every session publish by `latency` before it is accepted
    pub fn set_publish_latency(&self, latency: Duration) {
        *self.hub.publish_latency.lock() = latency;
    }

    /// Number of connect calls seen so far, successful or not
    pub fn connect_attempts(&self) -> u32 {
        self.hub.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of sessions currently open
    pub fn session_count(&self) -> usize {
        self.hub.sessions.lock().len()
    }

    /// Live subscriptions on an exact topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.hub
            .subscriptions
            .lock()
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|subscription| !subscription.sender.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Publish from outside any session, as an upstream service would
    ///
    /// Returns the number of subscriptions the message was delivered to.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.inject_with_headers(topic, payload, &Metadata::new())
    }

    pub fn inject_with_headers(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        headers: &Metadata,
    ) -> usize {
        self.hub.deliver(topic, payload.into(), headers, None)
    }

    /// Inject a request whose handler should acknowledge on `reply_to`
    pub fn inject_request(&self, topic: &str, payload: impl Into<Bytes>, reply_to: &str) -> usize {
        self.hub
            .deliver(topic, payload.into(), &Metadata::new(), Some(reply_to))
    }

    /// Close every open session as if the broker restarted
    pub fn disconnect_all(&self) {
        let session_ids: Vec<u64> = self.hub.sessions.lock().keys().copied().collect();
        for session_id in session_ids {
            self.hub.drop_session(session_id);
        }
    }

    /// Logged publishes accepted from sessions, oldest first
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.hub.published.lock().iter().cloned().collect()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.hub
            .published
            .lock()
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn BrokerSession>, MessagingError> {
        self.hub.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.hub.unreachable.load(Ordering::SeqCst) {
            return Err(MessagingError::connection(format!(
                "broker at {address} is unreachable"
            )));
        }

        let session_id = self.hub.next_session_id.fetch_add(1, Ordering::SeqCst);
        let (lost_tx, lost_rx) = watch::channel(false);
        self.hub.sessions.lock().insert(session_id, lost_tx);

        Ok(Arc::new(InMemorySession {
            hub: self.hub.clone(),
            session_id,
            lost: lost_rx,
        }))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

struct InMemorySession {
    hub: Arc<Hub>,
    session_id: u64,
    lost: watch::Receiver<bool>,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), MessagingError> {
        if *self.lost.borrow() {
            Err(MessagingError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;

        let latency = *self.hub.publish_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected_failure = self
            .hub
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected_failure {
            return Err(MessagingError::publish(topic, "injected publish failure"));
        }

        self.hub.record(topic, payload.clone(), headers);
        self.hub.deliver(topic, payload, headers, None);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, MessagingError> {
        self.ensure_open()?;

        let (sender, receiver) = mpsc::unbounded();
        self.hub
            .subscriptions
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(SessionSubscription {
                session_id: self.session_id,
                sender,
            });

        Ok(receiver.boxed())
    }

    async fn closed(&self) {
        let mut lost = self.lost.clone();
        let _ = lost.wait_for(|lost| *lost).await;
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.hub.drop_session(self.session_id);
        Ok(())
    }
}
