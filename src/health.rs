//! # Health Reporter
//!
//! Liveness and readiness derived from connection state and loop status.
//! The reporter never writes connection state; it observes the connection
//! manager's watch channel. Loop supervision and the publish path report
//! into it through the `mark_*`/`record_*` methods.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::connection::ConnectionState;

/// Point-in-time view of worker health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub live: bool,
    pub ready: bool,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    pub connection_state: ConnectionState,
    pub registration_complete: bool,
    pub loop_failure: Option<String>,
    pub uptime_seconds: u64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HealthReporter {
    connection: watch::Receiver<ConnectionState>,
    registration_complete: AtomicBool,
    loop_failed: AtomicBool,
    loop_failure: RwLock<Option<String>>,
    degraded: RwLock<Option<String>>,
    started_at: Instant,
}

impl HealthReporter {
    pub fn new(connection: watch::Receiver<ConnectionState>) -> Self {
        Self {
            connection,
            registration_complete: AtomicBool::new(false),
            loop_failed: AtomicBool::new(false),
            loop_failure: RwLock::new(None),
            degraded: RwLock::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// A receiver that observes every connection state transition
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// False once a supervised loop task has exited unexpectedly
    pub fn liveness(&self) -> bool {
        !self.loop_failed.load(Ordering::Acquire)
    }

    pub fn readiness(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
            && self.registration_complete.load(Ordering::Acquire)
            && self.liveness()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.read().is_some()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let connection_state = self.connection_state();
        let registration_complete = self.registration_complete.load(Ordering::Acquire);
        let live = self.liveness();
        let degraded_reason = self.degraded.read().clone();

        HealthSnapshot {
            live,
            ready: live && registration_complete && connection_state == ConnectionState::Connected,
            degraded: degraded_reason.is_some(),
            degraded_reason,
            connection_state,
            registration_complete,
            loop_failure: self.loop_failure.read().clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            checked_at: Utc::now(),
        }
    }

    pub fn mark_registration_complete(&self) {
        if !self.registration_complete.swap(true, Ordering::AcqRel) {
            info!("Subscription registration complete");
        }
    }

    /// Record that a supervised task died; only the first failure is kept
    pub fn record_loop_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut failure = self.loop_failure.write();
        if failure.is_none() {
            error!(reason = %reason, "Subscription loop failure, worker is no longer live");
            *failure = Some(reason);
            self.loop_failed.store(true, Ordering::Release);
        }
    }

    pub fn mark_degraded(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "Worker health degraded");
        *self.degraded.write() = Some(reason);
    }

    pub fn clear_degraded(&self) {
        if self.degraded.write().take().is_some() {
            info!("Worker health no longer degraded");
        }
    }
}
