//! # Subscription Loop
//!
//! Binds topics to handlers at startup and runs the supervised receive and
//! dispatch tasks. Handler failures of any kind (errors, `Failed` results,
//! panics, timeouts) are isolated to the message and routed through the
//! dead-letter policy; they never stop the loop.
//!
//! ## Ordering
//!
//! No ordering holds across topics. Within a topic, messages are processed in
//! arrival order only when the topic's concurrency is 1
//! (see [`SubscriptionOptions::ordered`]).

mod dead_letter;
mod dispatcher;
mod handler;
mod queue;

pub use dead_letter::{DeadLetterOutcome, DeadLetterRouter};
pub use handler::{MessageHandler, Subscription, SubscriptionOptions};
pub use queue::{InboundQueue, PushOutcome};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ConfigurationError, WorkerConfig};
use crate::connection::ConnectionManager;
use crate::error::{Result, WorkerError};
use crate::health::HealthReporter;
use crate::metrics::WorkerMetrics;
use dispatcher::{Dispatcher, Executor};
use handler::panic_message;

/// Registry of subscriptions plus the tasks that serve them
pub struct SubscriptionLoop {
    subscriptions: DashMap<String, Arc<Subscription>>,
    started: AtomicBool,
    connection: Arc<ConnectionManager>,
    config: WorkerConfig,
    metrics: WorkerMetrics,
}

impl std::fmt::Debug for SubscriptionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionLoop")
            .field("topics", &self.topics())
            .field("started", &self.is_started())
            .finish()
    }
}

impl SubscriptionLoop {
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: WorkerConfig,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            subscriptions: DashMap::new(),
            started: AtomicBool::new(false),
            connection,
            config,
            metrics,
        }
    }

    /// Register `handler` for `topic` with default options
    pub fn register(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.register_with(topic, handler, SubscriptionOptions::default())
    }

    /// Register `handler` for `topic`
    ///
    /// Concurrency comes from `options`, then the `topics.concurrency`
    /// configuration, then the pool size.
    pub fn register_with(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscriptionOptions,
    ) -> Result<()> {
        if self.is_started() {
            return Err(WorkerError::RegistrationClosed {
                topic: topic.to_string(),
            });
        }

        validate_topic(topic)?;

        let concurrency = options
            .concurrency
            .or_else(|| self.config.topics.concurrency_for(topic))
            .unwrap_or(self.config.pool.size);
        if concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "concurrency",
                "0",
                format!("subscription {topic} needs a concurrency of at least 1"),
            )
            .into());
        }

        let subscription = Subscription {
            topic: topic.to_string(),
            handler,
            concurrency,
            result_topic: options
                .result_topic
                .unwrap_or_else(|| self.config.topics.outbound.clone()),
        };

        match self.subscriptions.entry(topic.to_string()) {
            Entry::Occupied(_) => {
                return Err(WorkerError::DuplicateSubscription {
                    topic: topic.to_string(),
                })
            }
            Entry::Vacant(entry) => {
                info!(
                    topic = %topic,
                    handler = %subscription.handler.name(),
                    concurrency,
                    result_topic = %subscription.result_topic,
                    "Registered subscription"
                );
                entry.insert(Arc::new(subscription));
            }
        }

        if self.is_started() {
            self.subscriptions.remove(topic);
            return Err(WorkerError::RegistrationClosed {
                topic: topic.to_string(),
            });
        }

        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Registered topics, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn subscription(&self, topic: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(topic).map(|entry| entry.value().clone())
    }

    /// Close registration and spawn the supervised receive and dispatch tasks
    pub fn start(&self) -> Result<LoopHandle> {
        if self.connection.is_shutting_down() {
            return Err(WorkerError::ShutdownInProgress);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(WorkerError::AlreadyStarted);
        }

        let topics = self.topics();
        let subscriptions: Vec<Arc<Subscription>> = topics
            .iter()
            .filter_map(|topic| self.subscription(topic))
            .collect();

        let (queue, inbound) = InboundQueue::bounded(
            self.config.pool.queue_capacity,
            self.config.pool.backpressure,
            self.metrics.clone(),
        );

        let executor = Arc::new(Executor {
            publisher: self.connection.clone(),
            dead_letter: DeadLetterRouter::new(
                self.config.dead_letter.resolve(),
                self.connection.clone(),
                self.metrics.clone(),
            ),
            handler_timeout: self.config.processing.timeout(),
            shutdown: self.connection.cancellation_token(),
            metrics: self.metrics.clone(),
        });

        let dispatcher = Dispatcher::new(
            subscriptions,
            self.config.pool.size,
            executor,
            self.connection.tracker().clone(),
        );

        let health = self.connection.health();
        health.mark_registration_complete();

        info!(
            topics = ?topics,
            pool_size = self.config.pool.size,
            queue_capacity = self.config.pool.queue_capacity,
            backpressure = ?self.config.pool.backpressure,
            dead_letter = self.config.dead_letter.resolve().label(),
            "Starting subscription loop"
        );

        let connection = self.connection.clone();
        let receiver = supervise("receiver", connection.clone(), async move {
            connection
                .run_receiver(topics, queue)
                .await
                .map_err(WorkerError::from)
        });
        let dispatcher = supervise(
            "dispatcher",
            self.connection.clone(),
            dispatcher.run(inbound),
        );

        Ok(LoopHandle {
            tasks: vec![receiver, dispatcher],
        })
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    let reason = if topic.trim().is_empty() {
        "topic name must not be empty"
    } else if topic.chars().any(char::is_whitespace) {
        "topic name must not contain whitespace"
    } else {
        return Ok(());
    };

    Err(WorkerError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    })
}

/// Run a loop task, reporting any unexpected end to the health reporter
fn supervise<F>(name: &'static str, connection: Arc<ConnectionManager>, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let health: Arc<HealthReporter> = connection.health();
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(task).catch_unwind().await;
        match outcome {
            Ok(Ok(())) if connection.is_shutting_down() => {
                debug!(task = name, "Loop task stopped");
            }
            Ok(Ok(())) => health.record_loop_failure(format!("{name} exited unexpectedly")),
            Ok(Err(e)) => health.record_loop_failure(format!("{name} failed: {e}")),
            Err(panic) => {
                health.record_loop_failure(format!("{name} panicked: {}", panic_message(&*panic)))
            }
        }
    })
}

/// Handles to the running loop tasks
#[derive(Debug)]
pub struct LoopHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl LoopHandle {
    /// Wait for every loop task to end; they end after shutdown begins
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Stop the tasks without waiting for them
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::messaging::{
        InMemoryBroker, Message, ProcessingContext, ProcessingResult, SpanContext,
    };
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(
            &self,
            message: &Message,
            _context: &ProcessingContext,
        ) -> std::result::Result<ProcessingResult, HandlerError> {
            Ok(ProcessingResult::completed(
                message.payload.clone(),
                SpanContext::detached(message.correlation_id()),
            ))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn subscription_loop(config: WorkerConfig) -> SubscriptionLoop {
        let metrics = WorkerMetrics::new().unwrap();
        let connection = ConnectionManager::new(
            Arc::new(InMemoryBroker::new()),
            &config.broker,
            metrics.clone(),
        );
        SubscriptionLoop::new(connection, config, metrics)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let subscriptions = subscription_loop(WorkerConfig::default());
        subscriptions.register("orders", Arc::new(Echo)).unwrap();

        let err = subscriptions.register("orders", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateSubscription { ref topic } if topic == "orders"));
    }

    #[test]
    fn empty_topic_is_rejected() {
        let subscriptions = subscription_loop(WorkerConfig::default());
        let err = subscriptions.register("  ", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidTopic { .. }));
    }

    #[test]
    fn concurrency_resolution_prefers_options_then_config_then_pool() {
        let mut config = WorkerConfig::default();
        config.pool.size = 8;
        config.topics.concurrency = vec![crate::config::TopicConcurrency {
            topic: "configured".to_string(),
            concurrency: 3,
        }];
        let subscriptions = subscription_loop(config);

        subscriptions.register("plain", Arc::new(Echo)).unwrap();
        subscriptions.register("configured", Arc::new(Echo)).unwrap();
        subscriptions
            .register_with("ordered", Arc::new(Echo), SubscriptionOptions::ordered())
            .unwrap();

        assert_eq!(subscriptions.subscription("plain").unwrap().concurrency, 8);
        assert_eq!(subscriptions.subscription("configured").unwrap().concurrency, 3);
        assert_eq!(subscriptions.subscription("ordered").unwrap().concurrency, 1);
        assert_eq!(
            subscriptions.subscription("plain").unwrap().result_topic,
            "worker.processed"
        );
    }

    #[tokio::test]
    async fn registration_closes_once_started() {
        let subscriptions = subscription_loop(WorkerConfig::default());
        subscriptions.register("orders", Arc::new(Echo)).unwrap();

        let handle = subscriptions.start().unwrap();
        let err = subscriptions.register("payments", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, WorkerError::RegistrationClosed { .. }));
        assert!(matches!(subscriptions.start(), Err(WorkerError::AlreadyStarted)));

        handle.abort();
    }

    #[tokio::test]
    async fn start_after_shutdown_is_rejected() {
        let subscriptions = subscription_loop(WorkerConfig::default());
        subscriptions.register("orders", Arc::new(Echo)).unwrap();
        subscriptions
            .connection
            .shutdown(std::time::Duration::from_millis(10))
            .await;

        assert!(matches!(subscriptions.start(), Err(WorkerError::ShutdownInProgress)));
        assert!(!subscriptions.is_started());
    }

    fn connection() -> Arc<ConnectionManager> {
        ConnectionManager::new(
            Arc::new(InMemoryBroker::new()),
            &WorkerConfig::default().broker,
            WorkerMetrics::new().unwrap(),
        )
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn supervised_panic_fails_liveness() {
        let connection = connection();
        let task = supervise("dispatcher", connection.clone(), async {
            panic!("boom");
            Ok(())
        });
        task.await.unwrap();

        let health = connection.health();
        assert!(!health.liveness());
        assert_eq!(
            health.snapshot().loop_failure.as_deref(),
            Some("dispatcher panicked: boom")
        );
    }

    #[tokio::test]
    async fn supervised_early_exit_fails_liveness() {
        let connection = connection();
        supervise("receiver", connection.clone(), async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(
            connection.health().snapshot().loop_failure.as_deref(),
            Some("receiver exited unexpectedly")
        );
    }

    #[tokio::test]
    async fn supervised_error_is_recorded() {
        let connection = connection();
        supervise("dispatcher", connection.clone(), async {
            Err(WorkerError::LoopTask {
                task: "dispatcher lane".to_string(),
                message: "lane exited".to_string(),
            })
        })
        .await
        .unwrap();

        let failure = connection.health().snapshot().loop_failure.unwrap();
        assert!(failure.starts_with("dispatcher failed: "));
        assert!(failure.contains("lane exited"));
    }

    #[tokio::test]
    async fn supervised_exit_during_shutdown_is_clean() {
        let connection = connection();
        connection.shutdown(std::time::Duration::from_millis(10)).await;

        supervise("receiver", connection.clone(), async { Ok(()) })
            .await
            .unwrap();

        assert!(connection.health().liveness());
        assert!(connection.health().snapshot().loop_failure.is_none());
    }
}
