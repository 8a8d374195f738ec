//! Retry policy with capped exponential backoff.

use agentfield_core::config::{ExecutionQueueConfig, ObservabilityConfig};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single HTTP call.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay after the `failed_attempts`-th failure: `min(base * 2^(n-1), max)`.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (failed_attempts - 1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn for_observability(config: &ObservabilityConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.retry_backoff(),
            max_backoff: config.max_retry_backoff(),
            timeout: config.http_timeout(),
        }
    }

    pub fn for_execution_webhooks(config: &ExecutionQueueConfig) -> Self {
        Self {
            max_attempts: config.webhook_max_attempts.max(1),
            base_backoff: config.webhook_retry_backoff(),
            max_backoff: config.webhook_max_retry_backoff(),
            timeout: config.webhook_timeout(),
        }
    }
}
