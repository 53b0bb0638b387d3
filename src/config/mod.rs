//! # Worker Configuration
//!
//! Typed configuration for the worker service. Values are layered by
//! [`ConfigManager`]: built-in defaults, an optional TOML file, `WORKER__*`
//! environment variables, then the flat variables the service has always
//! honoured (`NATS_URL`, `WORKER_POOL_SIZE`, ...).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use worker_service::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//! println!("broker: {}", config.broker.address);
//! println!("pool size: {}", config.pool.size);
//! # Ok(())
//! # }
//! ```
//!
//! Durations are expressed in milliseconds (`*_ms`) and exposed as
//! [`Duration`] through accessor methods.

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::BackoffPolicy;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Broker connection and reconnect behaviour
    pub broker: BrokerConfig,

    /// Worker pool sizing and backpressure
    pub pool: PoolConfig,

    /// Inbound/outbound topics and per-topic concurrency
    pub topics: TopicsConfig,

    /// Disposition of messages whose processing failed
    pub dead_letter: DeadLetterConfig,

    /// Work processor behaviour
    pub processing: ProcessingConfig,

    /// Graceful shutdown settings
    pub shutdown: ShutdownConfig,

    /// HTTP surface
    pub web: WebConfig,

    /// Log output
    pub logging: LoggingConfig,
}

/// Which broker implementation backs the connection manager
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrokerProvider {
    #[default]
    Nats,
    /// Process-local broker, useful for local runs and tests
    InMemory,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub provider: BrokerProvider,
    pub address: String,
    pub client_name: String,
    pub connect_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of each delay added as random jitter (0.0 - 1.0)
    pub jitter_ratio: f64,
    /// `None` retries forever
    pub max_connect_attempts: Option<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            provider: BrokerProvider::Nats,
            address: "nats://nats:4222".to_string(),
            client_name: "worker-service".to_string(),
            connect_timeout_ms: 5_000,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
            max_connect_attempts: None,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect backoff derived from this configuration
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
            jitter_ratio: self.jitter_ratio,
            max_attempts: self.max_connect_attempts,
        }
    }
}

/// What the receive path does when the inbound queue is full
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for queue space, stalling delivery from the broker
    #[default]
    Block,
    /// Drop the incoming message and log a warning
    Drop,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum handlers executing at once across all topics
    pub size: usize,
    /// Capacity of the bounded inbound queue
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            queue_capacity: 100,
            backpressure: BackpressurePolicy::Block,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TopicConcurrency {
    pub topic: String,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TopicsConfig {
    pub inbound: String,
    pub outbound: String,
    /// Per-topic concurrency; topics not listed use the pool size
    pub concurrency: Vec<TopicConcurrency>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            inbound: "api.data.accessed".to_string(),
            outbound: "worker.processed".to_string(),
            concurrency: Vec::new(),
        }
    }
}

impl TopicsConfig {
    pub fn concurrency_for(&self, topic: &str) -> Option<usize> {
        self.concurrency
            .iter()
            .find(|entry| entry.topic == topic)
            .map(|entry| entry.concurrency)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterMode {
    #[default]
    Drop,
    RequeueOnce,
    #[serde(alias = "publish_to_dead_letter_topic", alias = "dead_letter_topic")]
    Topic,
}

/// Resolved dead-letter policy applied by the subscription loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterPolicy {
    Drop,
    RequeueOnce,
    PublishToTopic(String),
}

impl DeadLetterPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::RequeueOnce => "requeue_once",
            Self::PublishToTopic(_) => "dead_letter_topic",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub policy: DeadLetterMode,
    pub topic: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            policy: DeadLetterMode::Drop,
            topic: "worker.dead_letter".to_string(),
        }
    }
}

impl DeadLetterConfig {
    pub fn resolve(&self) -> DeadLetterPolicy {
        match self.policy {
            DeadLetterMode::Drop => DeadLetterPolicy::Drop,
            DeadLetterMode::RequeueOnce => DeadLetterPolicy::RequeueOnce,
            DeadLetterMode::Topic => DeadLetterPolicy::PublishToTopic(self.topic.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Simulated work performed per invocation
    pub work_duration_ms: u64,
    /// Upper bound for one invocation, enforced by both processor and loop
    pub timeout_ms: u64,
    pub max_payload_bytes: usize,
    pub require_utf8: bool,
    pub completion_payload: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            work_duration_ms: 500,
            timeout_ms: 30_000,
            max_payload_bytes: 1024 * 1024,
            require_utf8: true,
            completion_payload: "Work completed".to_string(),
        }
    }
}

impl ProcessingConfig {
    pub fn work_duration(&self) -> Duration {
        Duration::from_millis(self.work_duration_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub graceful_deadline_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_deadline_ms: 10_000,
        }
    }
}

impl ShutdownConfig {
    pub fn graceful_deadline(&self) -> Duration {
        Duration::from_millis(self.graceful_deadline_ms)
    }
}

/// Slack between the processing timeout and the HTTP request timeout
pub const REQUEST_TIMEOUT_HEADROOM_MS: u64 = 1_000;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub request_timeout_ms: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8000".to_string(),
            request_timeout_ms: 35_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit filter directive; `None` picks a level from the environment
    pub level: Option<String>,
    pub format: LogFormat,
}

impl WorkerConfig {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.broker.address.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "broker.address",
                "broker configuration",
            ));
        }

        if self.broker.connect_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "broker.connect_timeout_ms",
                "0",
                "connect timeout must be greater than 0",
            ));
        }

        if self.broker.backoff_base_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "broker.backoff_base_ms",
                "0",
                "backoff base must be greater than 0",
            ));
        }

        if self.broker.backoff_max_ms < self.broker.backoff_base_ms {
            return Err(ConfigurationError::invalid_value(
                "broker.backoff_max_ms",
                self.broker.backoff_max_ms.to_string(),
                "backoff cap must be at least the backoff base",
            ));
        }

        if !(self.broker.backoff_multiplier >= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "broker.backoff_multiplier",
                self.broker.backoff_multiplier.to_string(),
                "multiplier must be >= 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&self.broker.jitter_ratio) {
            return Err(ConfigurationError::invalid_value(
                "broker.jitter_ratio",
                self.broker.jitter_ratio.to_string(),
                "jitter ratio must be between 0.0 and 1.0",
            ));
        }

        if self.broker.max_connect_attempts == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "broker.max_connect_attempts",
                "0",
                "omit the field for unlimited attempts",
            ));
        }

        if self.pool.size == 0 {
            return Err(ConfigurationError::invalid_value(
                "pool.size",
                "0",
                "pool size must be greater than 0",
            ));
        }

        if self.pool.queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "pool.queue_capacity",
                "0",
                "queue capacity must be greater than 0",
            ));
        }

        for (field, topic) in [
            ("topics.inbound", &self.topics.inbound),
            ("topics.outbound", &self.topics.outbound),
        ] {
            if topic.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    field,
                    "topics configuration",
                ));
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.topics.concurrency {
            if entry.concurrency == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("topics.concurrency[{}]", entry.topic),
                    "0",
                    "per-topic concurrency must be greater than 0",
                ));
            }
            if !seen.insert(entry.topic.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    "topics.concurrency",
                    entry.topic.clone(),
                    "topic listed more than once",
                ));
            }
        }

        if self.dead_letter.policy == DeadLetterMode::Topic {
            if self.dead_letter.topic.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "dead_letter.topic",
                    "dead-letter topic policy",
                ));
            }
            if self.dead_letter.topic == self.topics.inbound {
                return Err(ConfigurationError::invalid_value(
                    "dead_letter.topic",
                    self.dead_letter.topic.clone(),
                    "dead-letter topic must differ from the inbound topic",
                ));
            }
        }

        if self.processing.timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "processing.timeout_ms",
                "0",
                "processing timeout must be greater than 0",
            ));
        }

        if self.processing.max_payload_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "processing.max_payload_bytes",
                "0",
                "payload limit must be greater than 0",
            ));
        }

        if self.web.enabled && self.web.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigurationError::invalid_value(
                "web.bind_address",
                self.web.bind_address.clone(),
                "expected host:port",
            ));
        }

        // `/process` reports its own timeout; the HTTP layer must not cut in first
        let minimum_request_timeout = self
            .processing
            .timeout_ms
            .saturating_add(REQUEST_TIMEOUT_HEADROOM_MS);
        if self.web.enabled && self.web.request_timeout_ms < minimum_request_timeout {
            return Err(ConfigurationError::invalid_value(
                "web.request_timeout_ms",
                self.web.request_timeout_ms.to_string(),
                format!("must be at least processing.timeout_ms + {REQUEST_TIMEOUT_HEADROOM_MS}"),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service_contract() {
        let config = WorkerConfig::default();
        assert_eq!(config.broker.address, "nats://nats:4222");
        assert_eq!(config.topics.inbound, "api.data.accessed");
        assert_eq!(config.topics.outbound, "worker.processed");
        assert_eq!(config.pool.size, 10);
        assert_eq!(config.processing.work_duration(), Duration::from_millis(500));
        assert_eq!(config.dead_letter.resolve(), DeadLetterPolicy::Drop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_policy_carries_broker_settings() {
        let broker = BrokerConfig {
            max_connect_attempts: Some(3),
            ..Default::default()
        };
        let policy = broker.backoff_policy();
        assert_eq!(policy.base, Duration::from_millis(200));
        assert_eq!(policy.max, Duration::from_secs(10));
        assert_eq!(policy.max_attempts, Some(3));
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut config = WorkerConfig::default();
        config.pool.size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { ref field, .. }) if field == "pool.size"
        ));
    }

    #[test]
    fn dead_letter_topic_cannot_loop_back_to_inbound() {
        let mut config = WorkerConfig::default();
        config.dead_letter.policy = DeadLetterMode::Topic;
        config.dead_letter.topic = config.topics.inbound.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_concurrency_override_is_rejected() {
        let mut config = WorkerConfig::default();
        config.topics.concurrency = vec![
            TopicConcurrency {
                topic: "a".into(),
                concurrency: 1,
            },
            TopicConcurrency {
                topic: "a".into(),
                concurrency: 2,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn concurrency_lookup_falls_through_for_unknown_topics() {
        let mut topics = TopicsConfig::default();
        topics.concurrency.push(TopicConcurrency {
            topic: "orders".into(),
            concurrency: 1,
        });
        assert_eq!(topics.concurrency_for("orders"), Some(1));
        assert_eq!(topics.concurrency_for("payments"), None);
    }

    #[test]
    fn jitter_outside_unit_range_is_rejected() {
        let mut config = WorkerConfig::default();
        config.broker.jitter_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_bind_address_is_rejected_only_when_web_enabled() {
        let mut config = WorkerConfig::default();
        config.web.bind_address = "not-an-address".into();
        assert!(config.validate().is_err());
        config.web.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn request_timeout_must_outlast_processing_timeout() {
        let mut config = WorkerConfig::default();
        config.processing.timeout_ms = 30_000;
        config.web.request_timeout_ms = 30_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { ref field, .. }) if field == "web.request_timeout_ms"
        ));

        config.web.request_timeout_ms = 31_000;
        assert!(config.validate().is_ok());

        config.web.request_timeout_ms = 1;
        config.web.enabled = false;
        assert!(config.validate().is_ok());
    }
}
