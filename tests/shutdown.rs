//! Graceful and forced shutdown

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use worker_service::connection::ConnectionState;
use worker_service::messaging::FailureReason;
use worker_service::ProcessingStatus;

#[tokio::test(start_paused = true)]
async fn deadline_force_closes_session_with_handler_still_running() {
    let (broker, service) = service_with(test_config());
    let handler = Arc::new(StubbornHandler::new(Duration::from_secs(5)));
    service.register("orders", handler.clone()).unwrap();
    service.start().unwrap();
    wait_subscribed(&broker, &service).await;

    broker.inject("orders", "slow");
    assert!(wait_until(Duration::from_secs(1), || handler.started.load(Ordering::SeqCst)).await);

    let report = service.shutdown(Duration::from_secs(2)).await;

    assert!(!report.graceful);
    assert_eq!(report.in_flight_at_start, 1);
    assert_eq!(report.in_flight_at_deadline, 1);
    assert!(handler.saw_cancellation.load(Ordering::SeqCst));
    assert!(!handler.finished.load(Ordering::SeqCst));
    assert_eq!(service.connection().state(), ConnectionState::Disconnected);
    assert_eq!(broker.session_count(), 0);
    assert!(!service.health().readiness());
}

#[tokio::test(start_paused = true)]
async fn cancellation_aware_work_drains_before_deadline() {
    let mut config = test_config();
    config.processing.work_duration_ms = 5_000;
    let (broker, service) = service_with(config);
    service.register_default_subscription().unwrap();
    service.start().unwrap();
    wait_subscribed(&broker, &service).await;

    broker.inject("api.data.accessed", "payload");
    assert!(wait_until(Duration::from_secs(1), || service.metrics().in_flight() == 1).await);

    let report = service.shutdown(Duration::from_secs(2)).await;

    assert!(report.graceful);
    assert_eq!(report.in_flight_at_deadline, 0);
    assert_eq!(service.metrics().messages_failed("cancelled"), 1);
    assert!(broker.published_to("worker.processed").is_empty());
    assert_eq!(service.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn idle_shutdown_is_graceful_and_stops_delivery() {
    let (broker, service) = service_with(test_config());
    let handler = Arc::new(RecordingHandler::default());
    service.register("orders", handler.clone()).unwrap();
    service.start().unwrap();
    wait_subscribed(&broker, &service).await;

    let report = service.shutdown(Duration::from_secs(1)).await;

    assert!(report.graceful);
    assert_eq!(report.in_flight_at_start, 0);
    assert_eq!(broker.subscriber_count("orders"), 0);
    assert_eq!(broker.inject("orders", "late"), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handler.count(), 0);
}

#[tokio::test]
async fn manual_processing_after_shutdown_reports_cancelled() {
    let mut config = test_config();
    config.processing.work_duration_ms = 1_000;
    let (broker, service) = service_with(config);
    service.register_default_subscription().unwrap();
    service.start().unwrap();
    wait_subscribed(&broker, &service).await;

    service.shutdown(Duration::from_secs(1)).await;
    let (_, result) = service.process_once().await;

    assert_eq!(result.status, ProcessingStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::Cancelled));
    assert!(broker.published().is_empty());
}
