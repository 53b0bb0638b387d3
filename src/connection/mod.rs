//! # Broker Connection Manager
//!
//! Owns the lifecycle of the single broker session: connect with backoff,
//! publish with one retry, reconnect after broker-initiated close, and
//! graceful shutdown. It is also the only writer of [`ConnectionState`];
//! every transition is broadcast on a watch channel that the
//! [`HealthReporter`] observes.
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                        │                  │
//!       └──────── failure ───────┘◀── broker close ─┘
//!
//!  any ──shutdown──▶ Draining ──deadline/drained──▶ Disconnected
//! ```

pub mod backoff;

pub use backoff::BackoffPolicy;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::loader::redact_address;
use crate::config::BrokerConfig;
use crate::error::{ConnectionError, PublishError};
use crate::health::HealthReporter;
use crate::messaging::{BrokerSession, BrokerTransport, Delivery, Metadata, Publisher};
use crate::metrics::WorkerMetrics;
use crate::subscription::{InboundQueue, PushOutcome};

/// Broker connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// Shutdown requested; no new connections are made
    Draining = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Draining,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Outcome of [`ConnectionManager::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every in-flight handler finished before the deadline
    pub graceful: bool,
    pub in_flight_at_start: usize,
    /// Handlers still running when the session was force-closed
    pub in_flight_at_deadline: usize,
}

enum ReceiveOutcome {
    Shutdown,
    SessionLost,
    QueueClosed,
}

/// Manages the broker session shared by the receive path and publishers
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    address: String,
    connect_timeout: Duration,
    backoff: BackoffPolicy,
    state: AtomicU8,
    state_tx: watch::Sender<ConnectionState>,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    health: Arc<HealthReporter>,
    metrics: WorkerMetrics,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("provider", &self.transport.provider_name())
            .field("address", &redact_address(&self.address))
            .field("state", &self.state())
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        config: &BrokerConfig,
        metrics: WorkerMetrics,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let health = Arc::new(HealthReporter::new(state_rx));
        metrics.set_connection_state(ConnectionState::Disconnected);

        info!(
            provider = transport.provider_name(),
            address = %redact_address(&config.address),
            connect_timeout_ms = config.connect_timeout_ms,
            max_connect_attempts = ?config.max_connect_attempts,
            "Connection manager initialized"
        );

        Arc::new(Self {
            transport,
            address: config.address.clone(),
            connect_timeout: config.connect_timeout(),
            backoff: config.backoff_policy(),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            state_tx,
            session: RwLock::new(None),
            health,
            metrics,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn health(&self) -> Arc<HealthReporter> {
        self.health.clone()
    }

    /// Cancelled when shutdown begins; handed to every handler invocation
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tracks in-flight handler tasks so shutdown can wait for them
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn current_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.session.read().clone()
    }

    fn transition(&self, next: ConnectionState) {
        let shutting_down = self.shutdown.is_cancelled();
        let changed = self.state_tx.send_if_modified(|state| {
            let allowed = match (*state, next) {
                (current, next) if current == next => false,
                // Only shutdown leaves Draining, via `finish_drain`
                (ConnectionState::Draining, _) => false,
                (_, ConnectionState::Connecting | ConnectionState::Connected) => !shutting_down,
                _ => true,
            };
            if allowed {
                *state = next;
                self.record_state(next);
            }
            allowed
        });

        if changed {
            debug!(state = %next, "Connection state changed");
        }
    }

    fn finish_drain(&self) {
        self.state_tx.send_modify(|state| {
            *state = ConnectionState::Disconnected;
            self.record_state(ConnectionState::Disconnected);
        });
        debug!(state = %ConnectionState::Disconnected, "Connection state changed");
    }

    /// Mirror a watch-channel write; callers hold the channel's lock
    fn record_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
        self.metrics.set_connection_state(state);
    }

    /// Close a session without letting a wedged broker stall the caller
    async fn close_session(&self, session: &Arc<dyn BrokerSession>) {
        match tokio::time::timeout(self.connect_timeout, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Error closing broker session"),
            Err(_) => warn!(
                timeout_ms = self.connect_timeout.as_millis() as u64,
                "Timed out closing broker session"
            ),
        }
    }

    /// Establish a session, retrying with exponential backoff
    ///
    /// Retries until connected unless `max_connect_attempts` is configured.
    /// Returns [`ConnectionError::ShuttingDown`] if shutdown starts first.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerSession>, ConnectionError> {
        let address = redact_address(&self.address);
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(ConnectionError::ShuttingDown);
            }

            attempt = attempt.saturating_add(1);
            self.transition(ConnectionState::Connecting);
            self.metrics.record_connection_attempt();

            let result = tokio::time::timeout(
                self.connect_timeout,
                self.transport.connect(&self.address, self.connect_timeout),
            )
            .await;

            let error = match result {
                Ok(Ok(session)) => {
                    // Shutdown cancels before it takes the slot, so under
                    // this lock either we see the cancel or it sees the session
                    let stored = {
                        let mut slot = self.session.write();
                        if self.shutdown.is_cancelled() {
                            false
                        } else {
                            *slot = Some(session.clone());
                            true
                        }
                    };
                    if !stored {
                        self.close_session(&session).await;
                        return Err(ConnectionError::ShuttingDown);
                    }
                    self.transition(ConnectionState::Connected);
                    info!(address = %address, attempt, "Connected to broker");
                    return Ok(session);
                }
                Ok(Err(e)) => ConnectionError::transport(address.clone(), e),
                Err(_) => ConnectionError::timeout(address.clone(), self.connect_timeout),
            };

            self.transition(ConnectionState::Disconnected);

            if self.backoff.exhausted(attempt) {
                warn!(address = %address, attempts = attempt, error = %error, "Giving up on broker connection");
                return Err(ConnectionError::AttemptsExhausted {
                    address,
                    attempts: attempt,
                });
            }

            let delay = self.backoff.delay_for(attempt);
            warn!(
                address = %address,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Broker connection failed, backing off"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ConnectionError::ShuttingDown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Publish on the current session, retrying once
    ///
    /// A second failure marks health degraded; the next successful publish
    /// clears it.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), PublishError> {
        const ATTEMPTS: u32 = 2;
        let mut last_error = None;

        for attempt in 1..=ATTEMPTS {
            let Some(session) = self.current_session() else {
                debug!(topic = %topic, attempt, "Publish attempted without a broker session");
                continue;
            };

            match session.publish(topic, payload.clone(), headers).await {
                Ok(()) => {
                    self.metrics.record_publish();
                    self.health.clear_degraded();
                    debug!(topic = %topic, attempt, bytes = payload.len(), "Published message");
                    return Ok(());
                }
                Err(e) => {
                    warn!(topic = %topic, attempt, error = %e, "Publish attempt failed");
                    last_error = Some(e);
                }
            }
        }

        self.metrics.record_publish_failure();
        let error = match last_error {
            Some(e) => PublishError::Failed {
                topic: topic.to_string(),
                attempts: ATTEMPTS,
                message: e.to_string(),
            },
            None => PublishError::NotConnected {
                topic: topic.to_string(),
            },
        };
        self.health.mark_degraded(error.to_string());
        Err(error)
    }

    /// Receive path: connect, subscribe, forward deliveries into `queue`
    ///
    /// Runs until shutdown or until the queue's consumer goes away. A
    /// broker-initiated close drops the session, sets Disconnected and
    /// reconnects with the same subscriptions.
    pub async fn run_receiver(
        &self,
        topics: Vec<String>,
        queue: InboundQueue,
    ) -> Result<(), ConnectionError> {
        loop {
            let session = match self.connect().await {
                Ok(session) => session,
                Err(ConnectionError::ShuttingDown) => return Ok(()),
                Err(e) => return Err(e),
            };

            match self.receive(&session, &topics, &queue).await {
                ReceiveOutcome::Shutdown => return Ok(()),
                ReceiveOutcome::QueueClosed => {
                    warn!("Inbound queue closed, receive path stopping");
                    return Ok(());
                }
                ReceiveOutcome::SessionLost => {
                    warn!("Broker session lost, reconnecting");
                    self.invalidate(&session);
                    self.transition(ConnectionState::Disconnected);
                    self.close_session(&session).await;

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.backoff.base) => {}
                    }
                }
            }
        }
    }

    async fn receive(
        &self,
        session: &Arc<dyn BrokerSession>,
        topics: &[String],
        queue: &InboundQueue,
    ) -> ReceiveOutcome {
        let mut streams = Vec::with_capacity(topics.len());
        for topic in topics {
            match session.subscribe(topic).await {
                Ok(stream) => {
                    let subscription = topic.clone();
                    streams.push(
                        stream
                            .map(move |message| Delivery {
                                subscription: subscription.clone(),
                                message,
                            })
                            .boxed(),
                    );
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Subscribe failed");
                    return ReceiveOutcome::SessionLost;
                }
            }
        }

        info!(topics = ?topics, "Subscriptions established");
        let has_streams = !streams.is_empty();
        let mut inbound = futures::stream::select_all(streams);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return ReceiveOutcome::Shutdown,
                _ = session.closed() => return ReceiveOutcome::SessionLost,
                next = inbound.next(), if has_streams => match next {
                    Some(delivery) => {
                        self.metrics.record_received();
                        match queue.push(delivery, &self.shutdown).await {
                            PushOutcome::Queued | PushOutcome::Dropped => {}
                            PushOutcome::Cancelled => return ReceiveOutcome::Shutdown,
                            PushOutcome::Closed => return ReceiveOutcome::QueueClosed,
                        }
                    }
                    None => return ReceiveOutcome::SessionLost,
                },
            }
        }
    }

    fn invalidate(&self, lost: &Arc<dyn BrokerSession>) {
        let mut session = self.session.write();
        if session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, lost))
        {
            *session = None;
        }
    }

    /// Drain and disconnect
    ///
    /// Cancels the shared token, waits up to `deadline` for tracked handler
    /// tasks, then closes the session whether or not they finished.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let in_flight_at_start = self.tracker.len();
        info!(
            in_flight = in_flight_at_start,
            deadline_ms = deadline.as_millis() as u64,
            "Connection manager draining"
        );

        self.transition(ConnectionState::Draining);
        self.shutdown.cancel();
        self.tracker.close();

        let graceful = tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .is_ok();
        let in_flight_at_deadline = if graceful { 0 } else { self.tracker.len() };

        if !graceful {
            warn!(
                abandoned = in_flight_at_deadline,
                "Shutdown deadline reached with handlers still running, closing session"
            );
        }

        let session = self.session.write().take();
        if let Some(session) = session {
            self.close_session(&session).await;
        }

        self.finish_drain();
        info!(graceful, "Connection manager stopped");

        ShutdownReport {
            graceful,
            in_flight_at_start,
            in_flight_at_deadline,
        }
    }
}

#[async_trait]
impl Publisher for ConnectionManager {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &Metadata,
    ) -> Result<(), PublishError> {
        ConnectionManager::publish(self, topic, payload, headers).await
    }
}
