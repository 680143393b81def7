//! Bounded retry with exponential backoff for transient provider failures.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;

use super::ProviderResult;

/// Default number of attempts per provider call.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Default upper bound on a single delay in milliseconds.
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Retry policy for provider calls.
///
/// Only errors the provider classifies as transient are retried. Validation,
/// conflict and not-found errors fail on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy from raw settings.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms.max(base_delay_ms)),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based) after `error`.
    ///
    /// A throttling response that names a wait time is honoured, capped at
    /// `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Duration {
        if let ProviderError::Throttled {
            retry_after_secs: Some(secs),
        } = error
        {
            return Duration::from_secs(*secs).min(self.max_delay);
        }

        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error seen.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, &e);
                    warn!(
                        "{operation} failed (attempt {attempt}/{}): {e}; retrying in {}ms",
                        self.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("{operation} failed after {attempt} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
    }
}
