//! Bounded retry with exponential backoff and jitter

use crate::config::ApiSettings;
use crate::error::{FetchError, Result, TableSyncError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Upper bound on any single retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Retry limits and delays
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts in total
    pub max_attempts: u32,
    /// Maximum attempts that may end in a malformed response
    pub max_malformed_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Delay cap
    pub max_backoff: Duration,
    /// Jitter fraction in [0, 1)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_malformed_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Build from API settings
    pub fn from_settings(api: &ApiSettings) -> Self {
        Self {
            max_attempts: api.max_retries.max(1),
            max_malformed_attempts: api.max_malformed_attempts.max(1),
            initial_backoff: Duration::from_millis(api.initial_backoff_ms).min(MAX_BACKOFF),
            max_backoff: Duration::from_millis(api.max_backoff_ms.max(api.initial_backoff_ms))
                .min(MAX_BACKOFF),
            jitter: api.jitter,
        }
    }

    /// Policy without delays, for tests and local sources
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            max_malformed_attempts: max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry` with jitter applied
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

/// Runs one remote operation under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `op` until it succeeds or the policy is exhausted.
    ///
    /// `table` and `page` only label log lines and the final
    /// [`TableSyncError::FetchFailed`].
    pub async fn run<T, F, Fut>(&self, table: &str, page: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchError>>,
    {
        let mut attempts = 0u32;
        let mut malformed = 0u32;

        loop {
            attempts += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_malformed() {
                malformed += 1;
            }
            let exhausted = !err.is_retryable()
                || attempts >= self.policy.max_attempts
                || malformed >= self.policy.max_malformed_attempts;

            if exhausted {
                tracing::error!(
                    "Giving up on {} of '{}' after {} attempt(s): {}",
                    page,
                    table,
                    attempts,
                    err
                );
                return Err(TableSyncError::FetchFailed {
                    table: table.to_string(),
                    page: page.to_string(),
                    attempts,
                    source: err,
                });
            }

            let delay = self.policy.delay(attempts);
            if err.is_malformed() {
                tracing::warn!(
                    "Malformed response for {} of '{}' (attempt {}/{}): {}. Retrying in {}",
                    page,
                    table,
                    attempts,
                    self.policy.max_malformed_attempts,
                    err,
                    humantime::format_duration(delay)
                );
            } else {
                tracing::warn!(
                    "Fetch failed for {} of '{}' (attempt {}/{}): {}. Retrying in {}",
                    page,
                    table,
                    attempts,
                    self.policy.max_attempts,
                    err,
                    humantime::format_duration(delay)
                );
            }
            tokio::time::sleep(delay).await;
        }
    }
}
