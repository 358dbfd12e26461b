//! Linear retry backoff.

use std::time::Duration;

use listingflow_shared::RetryConfig;

/// How many times a stage retries an envelope and how long it waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.base_delay_ms))
    }

    /// Wait before re-publishing an envelope whose new retry count is
    /// `retry_count`: `base_delay * retry_count`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        self.base_delay.saturating_mul(retry_count)
    }

    /// Whether an envelope that has already been retried `retry_count` times
    /// may be retried once more.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
