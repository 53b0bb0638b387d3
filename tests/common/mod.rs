//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use worker_service::config::{BrokerProvider, WorkerConfig};
use worker_service::error::HandlerError;
use worker_service::messaging::{
    FailureReason, InMemoryBroker, Message, ProcessingContext, ProcessingResult, SpanContext,
};
use worker_service::{MessageHandler, WorkerService};

pub fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.broker.provider = BrokerProvider::InMemory;
    config.broker.address = "memory://test".to_string();
    config.broker.jitter_ratio = 0.0;
    config.processing.work_duration_ms = 0;
    config
}

pub fn service_with(config: WorkerConfig) -> (InMemoryBroker, Arc<WorkerService>) {
    let broker = InMemoryBroker::new();
    let service = WorkerService::new(config, Arc::new(broker.clone())).unwrap();
    (broker, service)
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the service is ready and subscribed to every topic
pub async fn wait_subscribed(broker: &InMemoryBroker, service: &WorkerService) {
    let topics = service.topics();
    let subscribed = wait_until(Duration::from_secs(5), || {
        service.health().readiness()
            && topics.iter().all(|topic| broker.subscriber_count(topic) == 1)
    })
    .await;
    assert!(subscribed, "service never became ready");
}

fn completed(message: &Message) -> ProcessingResult {
    ProcessingResult::completed(
        message.payload.clone(),
        SpanContext::detached(message.correlation_id()),
    )
}

/// Completes every message, recording payloads in processing order
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<Bytes>>,
    pub delay: Duration,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl RecordingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        message: &Message,
        _context: &ProcessingContext,
    ) -> Result<ProcessingResult, HandlerError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.seen.lock().push(message.payload.clone());
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(completed(message))
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    FailedResult,
    Error,
    /// Panics on payload `boom`, completes otherwise
    PanicOnBoom,
}

pub struct FailingHandler {
    pub mode: FailureMode,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<Message>>,
}

impl FailingHandler {
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(
        &self,
        message: &Message,
        _context: &ProcessingContext,
    ) -> Result<ProcessingResult, HandlerError> {
        self.seen.lock().push(message.clone());
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.mode {
            FailureMode::FailedResult => Ok(ProcessingResult::failed(
                FailureReason::InvalidInput("rejected".to_string()),
                SpanContext::detached(message.correlation_id()),
            )),
            FailureMode::Error => Err(HandlerError::failed("failing", "downstream exploded")),
            FailureMode::PanicOnBoom => {
                if message.payload == "boom" {
                    panic!("handler bug");
                }
                Ok(completed(message))
            }
        }
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Holds every invocation until permits are added to `gate`
pub struct GatedHandler {
    pub gate: Arc<Semaphore>,
    pub handled: AtomicUsize,
}

impl GatedHandler {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            handled: AtomicUsize::new(0),
        }
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for GatedHandler {
    async fn handle(
        &self,
        message: &Message,
        _context: &ProcessingContext,
    ) -> Result<ProcessingResult, HandlerError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| HandlerError::failed("gated", e))?;
        permit.forget();
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(completed(message))
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Runs for `duration`, noting but ignoring cancellation
pub struct StubbornHandler {
    pub duration: Duration,
    pub started: AtomicBool,
    pub saw_cancellation: AtomicBool,
    pub finished: AtomicBool,
}

impl StubbornHandler {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: AtomicBool::new(false),
            saw_cancellation: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessageHandler for StubbornHandler {
    async fn handle(
        &self,
        message: &Message,
        context: &ProcessingContext,
    ) -> Result<ProcessingResult, HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        let work = tokio::time::sleep(self.duration);
        tokio::pin!(work);

        tokio::select! {
            _ = &mut work => {}
            _ = context.cancellation.cancelled() => {
                self.saw_cancellation.store(true, Ordering::SeqCst);
                work.await;
            }
        }

        self.finished.store(true, Ordering::SeqCst);
        Ok(completed(message))
    }

    fn name(&self) -> &str {
        "stubborn"
    }
}
