//! Retry and backoff shared by the fetch leg and the delivery leg.
//!
//! ```text
//! attempt ─► success
//!    │
//!    ├─► retryable failure ─► backoff ─► attempt   (up to max_retries)
//!    │
//!    └─► non-retryable failure / retries spent ─► give up
//! ```
//!
//! Retryable: network errors, HTTP 429 and 5xx (see
//! [`SyncError::is_retryable`]). A 429 that carries a `Retry-After` hint
//! waits exactly that long; every other retry waits
//! `min(base * 2^attempt, max_delay)` with `attempt` counted from 0.
//! Running out of retries yields [`SyncError::Exhausted`] wrapping the last
//! error.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Wait before the retry that follows failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails for good, or `cancel` fires.
    ///
    /// `op` receives the 0-based attempt number. Cancellation drops an
    /// in-flight attempt as well as a pending backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                r = op(attempt) => r,
            };
            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(what, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.max_retries {
                warn!(what, attempts = attempt + 1, error = %err, "retries exhausted");
                return Err(SyncError::Exhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt, err.retry_after());
            warn!(
                what,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
