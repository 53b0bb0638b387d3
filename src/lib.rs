#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! # Worker Service
//!
//! A supervised pub/sub worker: subscribe to broker topics, process each
//! message on a bounded worker pool with tracing and metrics, publish a
//! completion event, and survive broker restarts and transient disconnects.
//!
//! ## Architecture
//!
//! ```text
//! broker ──▶ ConnectionManager (receive path) ──▶ bounded queue ──▶ SubscriptionLoop
//!    ▲                │                                                  │
//!    │                └── state ──▶ HealthReporter                       ▼
//!    └──────────── publish ◀───────────── result ◀──────────────── WorkProcessor
//! ```
//!
//! ## Module Organization
//!
//! - [`connection`] - Broker session lifecycle, backoff, publish retry, shutdown
//! - [`subscription`] - Topic registration, dispatch, dead-letter handling
//! - [`processor`] - The per-message unit of work
//! - [`health`] - Liveness and readiness
//! - [`messaging`] - Message types and broker providers (NATS, in-memory)
//! - [`metrics`] - Prometheus metrics
//! - [`service`] - Explicitly constructed service object
//! - [`web`] - axum HTTP surface
//! - [`config`] - Layered configuration
//! - [`logging`] - Tracing subscriber setup
//! - [`error`] - Error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use worker_service::config::ConfigManager;
//! use worker_service::WorkerService;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let service = WorkerService::from_config(manager.config().clone())?;
//! service.register_default_subscription()?;
//! service.start()?;
//!
//! // ... serve HTTP, wait for a signal ...
//!
//! let report = service.shutdown(Duration::from_secs(10)).await;
//! println!("graceful: {}", report.graceful);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod processor;
pub mod service;
pub mod subscription;
pub mod web;

pub use config::{ConfigManager, WorkerConfig};
pub use connection::{ConnectionManager, ConnectionState, ShutdownReport};
pub use error::{Result, WorkerError};
pub use health::{HealthReporter, HealthSnapshot};
pub use messaging::{Message, ProcessingContext, ProcessingResult, ProcessingStatus};
pub use metrics::WorkerMetrics;
pub use processor::WorkProcessor;
pub use service::WorkerService;
pub use subscription::{MessageHandler, SubscriptionLoop, SubscriptionOptions};
