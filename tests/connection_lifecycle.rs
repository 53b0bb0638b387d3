//! Connection manager behaviour: backoff, readiness, reconnect, publish retry

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio::time::Instant;
use worker_service::config::BrokerConfig;
use worker_service::connection::ConnectionState;
use worker_service::error::ConnectionError;
use worker_service::messaging::{FailureReason, InMemoryBroker};
use worker_service::{ConnectionManager, ProcessingStatus, WorkerMetrics};

const WAIT: Duration = Duration::from_secs(10);

fn unreachable_manager(max_attempts: u32) -> (InMemoryBroker, Arc<ConnectionManager>) {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let config = BrokerConfig {
        address: "memory://test".to_string(),
        jitter_ratio: 0.0,
        max_connect_attempts: Some(max_attempts),
        ..Default::default()
    };
    let manager = ConnectionManager::new(
        Arc::new(broker.clone()),
        &config,
        WorkerMetrics::new().unwrap(),
    );
    (broker, manager)
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_from_two_hundred_millis() {
    let (broker, manager) = unreachable_manager(4);
    let started = Instant::now();

    let result = manager.connect().await;

    // 200 + 400 + 800 between four attempts
    assert!(matches!(
        result.err(),
        Some(ConnectionError::AttemptsExhausted { attempts: 4, .. })
    ));
    assert_eq!(started.elapsed(), Duration::from_millis(1_400));
    assert_eq!(broker.connect_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn backoff_is_capped_at_ten_seconds() {
    let (_broker, manager) = unreachable_manager(9);
    let started = Instant::now();

    let _ = manager.connect().await;

    // 200, 400, 800, 1600, 3200, 6400, then 10s twice
    assert_eq!(started.elapsed(), Duration::from_millis(32_600));
}

#[tokio::test(start_paused = true)]
async fn readiness_waits_for_first_connection() {
    let mut config = test_config();
    config.broker.max_connect_attempts = None;
    let (broker, service) = service_with(config);
    broker.set_reachable(false);
    service.register_default_subscription().unwrap();
    service.start().unwrap();

    // Attempts at 0ms, 200ms, 600ms and 1400ms; the next is due at 3000ms
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(broker.connect_attempts(), 4);
    assert!(!service.health().readiness());
    assert!(service.health().liveness());

    broker.set_reachable(true);
    assert!(wait_until(WAIT, || service.health().readiness()).await);
    assert_eq!(broker.connect_attempts(), 5);
    assert_eq!(service.connection().state(), ConnectionState::Connected);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_connect_attempts_fail_liveness() {
    let mut config = test_config();
    config.broker.max_connect_attempts = Some(2);
    let (broker, service) = service_with(config);
    broker.set_reachable(false);
    service.register_default_subscription().unwrap();
    service.start().unwrap();

    assert!(wait_until(WAIT, || !service.health().liveness()).await);

    let snapshot = service.health().snapshot();
    assert!(!snapshot.live);
    assert!(!snapshot.ready);
    let failure = snapshot.loop_failure.unwrap();
    assert!(failure.starts_with("receiver failed: "), "{failure}");
    assert!(failure.contains("Gave up connecting"), "{failure}");
    assert_eq!(broker.connect_attempts(), 2);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn readiness_is_stable_without_state_changes() {
    let (broker, service) = service_with(test_config());
    service.register_default_subscription().unwrap();
    service.start().unwrap();
    wait_subscribed(&broker, &service).await;

    let health = service.health();
    let answers: Vec<bool> = (0..5).map(|_| health.readiness()).collect();
    assert_eq!(answers, vec![true; 5]);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn broker_close_triggers_reconnect_and_resubscribe() {
    let (broker, service) = service_with(test_config());
    let handler = Arc::new(RecordingHandler::default());
    service.register("orders", handler.clone()).unwrap();
    service.start().unwrap();
    wait_subscribed(&broker, &service).await;

    let mut states = service.health().subscribe_connection();
    broker.disconnect_all();

    tokio::time::timeout(WAIT, states.wait_for(|state| *state == ConnectionState::Disconnected))
        .await
        .unwrap()
        .unwrap();
    assert!(!service.health().readiness());

    tokio::time::timeout(WAIT, states.wait_for(|state| *state == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    wait_subscribed(&broker, &service).await;
    assert_eq!(service.metrics().connection_attempts(), 2);
    assert_eq!(broker.session_count(), 1);

    broker.inject("orders", "after reconnect");
    assert!(wait_until(WAIT, || handler.count() == 1).await);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn publish_failing_twice_degrades_until_next_success() {
    let (broker, service) = service_with(test_config());
    service.register_default_subscription().unwrap();
    service.start().unwrap();
    wait_subscribed(&broker, &service).await;

    broker.fail_next_publishes(2);
    let (_, result) = service.process_once().await;

    assert_eq!(result.status, ProcessingStatus::Failed);
    assert!(matches!(result.reason, Some(FailureReason::Downstream(_))));
    let snapshot = service.health().snapshot();
    assert!(snapshot.degraded);
    assert!(snapshot.ready);
    assert_eq!(service.metrics().publish_failures(), 1);

    let (_, result) = service.process_once().await;
    assert_eq!(result.status, ProcessingStatus::Completed);
    assert!(!service.health().snapshot().degraded);
    assert_eq!(broker.published_to("worker.processed").len(), 1);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn single_publish_failure_is_absorbed_by_retry() {
    let (broker, service) = service_with(test_config());
    service.register_default_subscription().unwrap();
    service.start().unwrap();
    wait_subscribed(&broker, &service).await;

    broker.fail_next_publishes(1);
    let (_, result) = service.process_once().await;

    assert_eq!(result.status, ProcessingStatus::Completed);
    assert!(!service.health().snapshot().degraded);
    assert_eq!(broker.published_to("worker.processed").len(), 1);

    service.shutdown(Duration::from_secs(1)).await;
}
