//! Worker metrics collection
//!
//! Every [`WorkerMetrics`] owns its own Prometheus [`Registry`], so several
//! services (or tests) can live in one process without colliding.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectionState;
use crate::error::Result;

/// Worker metrics collector
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    registry: Arc<Registry>,
    process_total: IntCounter,
    messages_received: IntCounter,
    messages_completed: IntCounter,
    messages_failed: IntCounterVec,
    messages_dead_lettered: IntCounterVec,
    messages_dropped: IntCounter,
    publish_total: IntCounter,
    publish_failures: IntCounter,
    connection_attempts: IntCounter,
    connection_state: IntGauge,
    queue_depth: IntGauge,
    in_flight: IntGauge,
    processing_duration: Histogram,
}

impl WorkerMetrics {
    /// Create new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let process_total = IntCounter::new(
            "worker_process_total",
            "Total number of work processor invocations",
        )?;
        let messages_received = IntCounter::new(
            "worker_messages_received_total",
            "Messages received from the broker",
        )?;
        let messages_completed = IntCounter::new(
            "worker_messages_completed_total",
            "Messages whose processing completed",
        )?;
        let messages_failed = IntCounterVec::new(
            Opts::new(
                "worker_messages_failed_total",
                "Messages whose processing failed, by failure kind",
            ),
            &["kind"],
        )?;
        let messages_dead_lettered = IntCounterVec::new(
            Opts::new(
                "worker_messages_dead_lettered_total",
                "Failed messages disposed of by the dead-letter policy",
            ),
            &["policy"],
        )?;
        let messages_dropped = IntCounter::new(
            "worker_messages_dropped_total",
            "Inbound messages dropped because the queue was full",
        )?;
        let publish_total =
            IntCounter::new("worker_publish_total", "Messages published to the broker")?;
        let publish_failures = IntCounter::new(
            "worker_publish_failures_total",
            "Publishes that failed after the retry",
        )?;
        let connection_attempts = IntCounter::new(
            "worker_connection_attempts_total",
            "Broker connection attempts",
        )?;
        let connection_state = IntGauge::new(
            "worker_connection_state",
            "Broker connection state (0 disconnected, 1 connecting, 2 connected, 3 draining)",
        )?;
        let queue_depth = IntGauge::new("worker_queue_depth", "Messages waiting in the inbound queue")?;
        let in_flight = IntGauge::new("worker_in_flight", "Handler invocations currently running")?;
        let processing_duration = Histogram::with_opts(HistogramOpts::new(
            "worker_processing_duration_seconds",
            "Time spent in the work processor",
        ))?;

        registry.register(Box::new(process_total.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_completed.clone()))?;
        registry.register(Box::new(messages_failed.clone()))?;
        registry.register(Box::new(messages_dead_lettered.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(publish_total.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(connection_attempts.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(processing_duration.clone()))?;

        Ok(Self {
            registry,
            process_total,
            messages_received,
            messages_completed,
            messages_failed,
            messages_dead_lettered,
            messages_dropped,
            publish_total,
            publish_failures,
            connection_attempts,
            connection_state,
            queue_depth,
            in_flight,
            processing_duration,
        })
    }

    /// Count one work processor invocation
    pub fn record_process_invocation(&self) {
        self.process_total.inc();
    }

    /// Total work processor invocations so far
    pub fn process_total(&self) -> u64 {
        self.process_total.get()
    }

    pub fn record_processing_duration(&self, elapsed: Duration) {
        self.processing_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_received(&self) {
        self.messages_received.inc();
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.get()
    }

    pub fn record_completed(&self) {
        self.messages_completed.inc();
    }

    pub fn messages_completed(&self) -> u64 {
        self.messages_completed.get()
    }

    pub fn record_failed(&self, kind: &str) {
        self.messages_failed.with_label_values(&[kind]).inc();
    }

    pub fn messages_failed(&self, kind: &str) -> u64 {
        self.messages_failed.with_label_values(&[kind]).get()
    }

    pub fn record_dead_lettered(&self, policy: &str) {
        self.messages_dead_lettered.with_label_values(&[policy]).inc();
    }

    pub fn messages_dead_lettered(&self, policy: &str) -> u64 {
        self.messages_dead_lettered.with_label_values(&[policy]).get()
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.inc();
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.get()
    }

    pub fn record_publish(&self) {
        self.publish_total.inc();
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.get()
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.inc();
    }

    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts.get()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state as i64);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn in_flight_inc(&self) {
        self.in_flight.inc();
    }

    pub fn in_flight_dec(&self) {
        self.in_flight.dec();
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.get()
    }

    /// Get metrics as Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("metrics output is not UTF-8: {e}")).into()
        })
    }
}
