//! Retry policy for model invocations.

use std::time::Duration;

use mentorlink_config::InvokerConfig;
use mentorlink_core::error::ProviderError;
use rand::Rng;

/// How many times to try, how long each attempt may take, and how long to
/// wait between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Add up to 10% random jitter to each backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&InvokerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &InvokerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs.max(1)),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            jitter: true,
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before retry number `retry` (1-based): `initial * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let cap = self.max_backoff.as_millis() as u64;
        let shift = retry.saturating_sub(1).min(20);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        Duration::from_millis(initial.saturating_mul(factor).min(cap))
    }

    /// The actual wait before retry number `retry`, after `error`.
    ///
    /// A provider-supplied `retry-after` raises the wait, still capped.
    pub fn delay(&self, retry: u32, error: &ProviderError) -> Duration {
        let mut wait = self.backoff(retry);
        if let ProviderError::RateLimited { retry_after_secs } = error {
            wait = wait.max(Duration::from_secs(*retry_after_secs)).min(self.max_backoff);
        }
        if self.jitter && !wait.is_zero() {
            let spread = (wait.as_millis() as u64 / 10).max(1);
            wait += Duration::from_millis(rand::rng().random_range(0..=spread));
        }
        wait
    }
}
