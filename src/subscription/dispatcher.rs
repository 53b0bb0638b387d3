//! # Dispatcher
//!
//! Moves deliveries from the inbound queue onto the worker pool.
//!
//! ```text
//! [pool permit] → inbound queue → dispatcher → lane(topic) → [topic permit] → handler task
//! ```
//!
//! The dispatcher takes a pool permit before it dequeues, so a message only
//! leaves the inbound queue once a worker slot is reserved for it. At most
//! `pool.size` messages are dispatched but unfinished; everything else waits
//! in the bounded queue, where the backpressure policy applies.
//!
//! Each lane is a task that acquires topic permits in arrival order. Tokio
//! semaphores are fair, so a lane with one permit processes its topic FIFO.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::dead_letter::DeadLetterRouter;
use super::handler::{panic_message, Subscription};
use crate::error::{HandlerError, WorkerError};
use crate::messaging::{
    Delivery, FailureReason, Message, Metadata, ProcessingContext, ProcessingResult, Publisher,
    CORRELATION_ID_HEADER, SOURCE_MESSAGE_ID_HEADER,
};
use crate::metrics::WorkerMetrics;

/// Shared by every handler task
pub(crate) struct Executor {
    pub publisher: Arc<dyn Publisher>,
    pub dead_letter: DeadLetterRouter,
    pub handler_timeout: Duration,
    pub shutdown: CancellationToken,
    pub metrics: WorkerMetrics,
}

impl Executor {
    /// Run one handler invocation and act on its outcome
    pub async fn execute(&self, subscription: &Subscription, message: Message) {
        let handler_name = subscription.handler.name().to_string();
        let context = ProcessingContext::new(self.shutdown.clone(), self.handler_timeout);
        let started = Instant::now();

        let execution = tokio::time::timeout(
            self.handler_timeout,
            AssertUnwindSafe(subscription.handler.handle(&message, &context)).catch_unwind(),
        )
        .await;

        let outcome = match execution {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked {
                handler: handler_name.clone(),
                message: panic_message(&*panic),
            }),
            Err(_) => Err(HandlerError::Timeout {
                handler: handler_name.clone(),
                timeout_ms: self.handler_timeout.as_millis() as u64,
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) if result.is_completed() => {
                debug!(
                    topic = %message.topic,
                    message_id = %message.id,
                    handler = %handler_name,
                    elapsed_ms,
                    "Handler completed"
                );
                self.metrics.record_completed();
                self.publish_result(subscription, &message, &result).await;
            }
            Ok(result) => {
                let reason = result
                    .reason
                    .unwrap_or_else(|| FailureReason::Handler("failed without a reason".to_string()));
                warn!(
                    topic = %message.topic,
                    message_id = %message.id,
                    handler = %handler_name,
                    reason = %reason,
                    elapsed_ms,
                    "Handler reported failure"
                );
                self.metrics.record_failed(reason.kind());
                self.dead_letter.route(&message, &reason.to_string()).await;
            }
            Err(e) => {
                error!(
                    topic = %message.topic,
                    message_id = %message.id,
                    handler = %handler_name,
                    error = %e,
                    elapsed_ms,
                    "Handler error"
                );
                self.metrics.record_failed(e.kind());
                self.dead_letter.route(&message, &e.to_string()).await;
            }
        }
    }

    async fn publish_result(
        &self,
        subscription: &Subscription,
        message: &Message,
        result: &ProcessingResult,
    ) {
        let mut headers = Metadata::new();
        headers.insert(
            CORRELATION_ID_HEADER.to_string(),
            result.span_context.correlation_id.to_string(),
        );
        headers.insert(SOURCE_MESSAGE_ID_HEADER.to_string(), message.id.to_string());

        if let Err(e) = self
            .publisher
            .publish(&subscription.result_topic, result.output.clone(), &headers)
            .await
        {
            error!(
                topic = %subscription.result_topic,
                message_id = %message.id,
                error = %e,
                "Failed to publish processing result"
            );
        }

        if let Some(reply_to) = &message.reply_to {
            if let Err(e) = self
                .publisher
                .publish(reply_to, result.output.clone(), &headers)
                .await
            {
                warn!(reply_to = %reply_to, message_id = %message.id, error = %e, "Failed to acknowledge request");
            }
        }
    }
}

/// A message with the pool slot reserved for it
type Dispatched = (Message, OwnedSemaphorePermit);

struct Lane {
    subscription: Arc<Subscription>,
    sender: mpsc::Sender<Dispatched>,
}

pub(crate) struct Dispatcher {
    subscriptions: Vec<Arc<Subscription>>,
    pool_size: usize,
    pool: Arc<Semaphore>,
    executor: Arc<Executor>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        subscriptions: Vec<Arc<Subscription>>,
        pool_size: usize,
        executor: Arc<Executor>,
        tracker: TaskTracker,
    ) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            subscriptions,
            pool_size,
            pool: Arc::new(Semaphore::new(pool_size)),
            executor,
            tracker,
        }
    }

    /// Route deliveries until shutdown or until the queue closes
    pub async fn run(self, mut inbound: mpsc::Receiver<Delivery>) -> Result<(), WorkerError> {
        let shutdown = self.executor.shutdown.clone();
        let mut lane_tasks = JoinSet::new();
        let mut lanes = HashMap::with_capacity(self.subscriptions.len());

        for subscription in &self.subscriptions {
            // Every queued entry holds a pool permit, so sends never wait
            let (sender, receiver) = mpsc::channel(self.pool_size);
            lane_tasks.spawn(run_lane(
                subscription.clone(),
                receiver,
                self.executor.clone(),
                self.tracker.clone(),
            ));
            lanes.insert(
                subscription.topic.clone(),
                Lane {
                    subscription: subscription.clone(),
                    sender,
                },
            );
        }

        info!(
            lanes = lanes.len(),
            pool_size = self.pool_size,
            "Dispatcher started"
        );

        loop {
            let pool_permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = lane_tasks.join_next() => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    return Err(lane_failure(joined));
                }
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = lane_tasks.join_next() => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    return Err(lane_failure(joined));
                }
                next = inbound.recv() => next,
            };
            let Some(delivery) = next else { break };
            self.executor.metrics.set_queue_depth(inbound.len());

            let Some(lane) = lanes.get(&delivery.subscription) else {
                warn!(
                    subscription = %delivery.subscription,
                    message_id = %delivery.message.id,
                    "No subscription for delivery, discarding"
                );
                continue;
            };

            debug!(
                topic = %lane.subscription.topic,
                message_id = %delivery.message.id,
                "Routing message to lane"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                sent = lane.sender.send((delivery.message, pool_permit)) => {
                    if sent.is_err() {
                        return Err(WorkerError::LoopTask {
                            task: "dispatcher lane".to_string(),
                            message: format!("lane for {} closed", lane.subscription.topic),
                        });
                    }
                }
            }
        }

        drop(lanes);
        lane_tasks.shutdown().await;
        info!("Dispatcher stopped");
        Ok(())
    }
}

fn lane_failure(joined: Result<(), JoinError>) -> WorkerError {
    let message = match joined {
        Ok(()) => "lane exited".to_string(),
        Err(e) if e.is_panic() => panic_message(&*e.into_panic()),
        Err(e) => e.to_string(),
    };
    WorkerError::LoopTask {
        task: "dispatcher lane".to_string(),
        message,
    }
}

async fn run_lane(
    subscription: Arc<Subscription>,
    mut receiver: mpsc::Receiver<Dispatched>,
    executor: Arc<Executor>,
    tracker: TaskTracker,
) {
    let topic_permits = Arc::new(Semaphore::new(subscription.concurrency.max(1)));
    let shutdown = executor.shutdown.clone();

    loop {
        let (message, pool_permit) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            next = receiver.recv() => match next {
                Some(dispatched) => dispatched,
                None => return,
            },
        };

        let topic_permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            permit = topic_permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let subscription = subscription.clone();
        let executor = executor.clone();
        tracker.spawn(async move {
            let _permits = (topic_permit, pool_permit);
            executor.metrics.in_flight_inc();
            executor.execute(&subscription, message).await;
            executor.metrics.in_flight_dec();
        });
    }
}
