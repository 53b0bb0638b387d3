//! Reconnect backoff calculation

use std::time::Duration;

/// Exponential backoff with additive jitter
///
/// Delay for attempt `n` (1-based) is `base * multiplier^(n-1)`, plus up to
/// `jitter_ratio` of that delay, never exceeding `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
    /// `None` means retry forever
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_ratio: 0.1,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after failed attempt number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_without_jitter(attempt);

        let jittered = if self.jitter_ratio > 0.0 {
            delay.mul_f64(1.0 + fastrand::f64() * self.jitter_ratio)
        } else {
            delay
        };

        jittered.min(self.max)
    }

    /// Deterministic part of [`delay_for`](Self::delay_for)
    pub fn delay_without_jitter(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = self.base.as_millis() as f64 * factor;

        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Whether `attempts` failed attempts use up the budget
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}
