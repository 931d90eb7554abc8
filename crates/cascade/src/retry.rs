//! Capped exponential backoff shared by fragment and key loading.
//!
//! Fragment loads run their retries through the scheduler's
//! FRAG_LOADING_WAITING_RETRY state, so they only use [`RetryPolicy`] for the
//! delay computation. Key loads run [`retry_with_backoff`] inside the load task.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{FragmentConfig, KeyConfig};
use crate::error::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub max_retry: u32,
    pub retry_delay: Duration,
    /// Hard cap on a single delay.
    pub max_retry_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retry: u32, retry_delay: Duration, max_retry_timeout: Duration) -> Self {
        Self {
            max_retry,
            retry_delay,
            max_retry_timeout,
        }
    }

    /// Delay before retry number `attempt` (1-indexed): `min(delay * 2^(attempt-1), cap)`.
    ///
    /// Returns `None` once the retry ceiling is exceeded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retry {
            return None;
        }
        let multiplier = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .retry_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_retry_timeout);
        Some(delay.min(self.max_retry_timeout))
    }
}

impl From<&FragmentConfig> for RetryPolicy {
    fn from(config: &FragmentConfig) -> Self {
        Self::new(config.max_retry, config.retry_delay, config.max_retry_timeout)
    }
}

impl From<&KeyConfig> for RetryPolicy {
    fn from(config: &KeyConfig) -> Self {
        Self::new(config.max_retry, config.retry_delay, config.max_retry_timeout)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    Success(T),
    Retry(LoadError),
    Fail(LoadError),
}

/// Execute an async operation with retry-and-backoff.
///
/// `operation` receives the attempt number (0 for the initial attempt).
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, LoadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(LoadError::Aborted);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };
        attempt += 1;
        let Some(delay) = policy.delay_for_attempt(attempt) else {
            return Err(err);
        };
        warn!(
            attempt,
            max = policy.max_retry,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(LoadError::Aborted),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Classify a load error as retryable or not.
pub fn classify<T>(result: Result<T, LoadError>) -> RetryAction<T> {
    match result {
        Ok(value) => RetryAction::Success(value),
        Err(err) if err.is_retryable() => RetryAction::Retry(err),
        Err(err) => RetryAction::Fail(err),
    }
}
