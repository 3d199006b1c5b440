//! Retry policy for failed renewal charges
//!
//! Decides whether a gateway failure is worth retrying and how long to wait
//! before the next attempt. The policy is pure: it never reads or writes
//! storage.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RenewalConfig;
use crate::gateway::GatewayError;

/// Whether a failure may resolve on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Transient,
    Terminal,
}

/// Exponential backoff with a retry budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RenewalConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RenewalConfig) -> Self {
        Self::new(config.max_retries, config.base_delay, config.max_delay)
    }

    /// Classify a gateway failure.
    ///
    /// Timeouts, provider 5xx and rate limiting are transient. Declines,
    /// credential problems and fraud flags are terminal regardless of the
    /// remaining budget.
    pub fn classify(&self, error: &GatewayError) -> ErrorClass {
        match error {
            GatewayError::Timeout
            | GatewayError::Unreachable(_)
            | GatewayError::ServerError { .. }
            | GatewayError::RateLimited { .. }
            | GatewayError::Cancelled => ErrorClass::Transient,
            GatewayError::CardDeclined(_)
            | GatewayError::InvalidCredentials(_)
            | GatewayError::FraudSuspected(_) => ErrorClass::Terminal,
        }
    }

    /// Delay before retry number `attempt`: `min(base * 2^attempt, max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        // 2^32 * base already saturates any sane max_delay
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Whether a subscription that has already failed `retry_count` times
    /// is out of budget after one more failure
    pub fn exhausted_after_failure(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) >= self.max_retries
    }
}
