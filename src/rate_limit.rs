//! Token-bucket gate for every outbound source API call.
//!
//! The bucket holds up to `capacity` tokens and refills continuously at
//! `requests_per_minute / 60` tokens per second. Each call consumes one
//! token; when none is available the caller sleeps until the next token is
//! due. Refill and consumption happen in one locked read-modify-write, so
//! any number of tasks may share a [`RateBudget`] through an `Arc`.
//!
//! The budget is an explicit handle rather than process-global state, so
//! independent engines (and tests) never share a bucket by accident.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateStats {
    pub requests_made: u64,
    pub requests_throttled: u64,
    pub total_wait: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    stats: RateStats,
}

#[derive(Debug)]
pub struct RateBudget {
    /// Tokens per second.
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateBudget {
    /// `burst_capacity` defaults to `max(10, rpm / 10)`. The bucket starts full.
    pub fn new(requests_per_minute: u32, burst_capacity: Option<u32>) -> Self {
        let rpm = requests_per_minute.max(1);
        let capacity = burst_capacity
            .filter(|c| *c > 0)
            .unwrap_or_else(|| (rpm / 10).max(10));
        Self {
            rate: f64::from(rpm) / 60.0,
            capacity: f64::from(capacity),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
                stats: RateStats::default(),
            }),
        }
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Wait for and consume one token.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// [`acquire`](Self::acquire) that gives up when `cancel` fires.
    pub async fn acquire_or_cancel(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Consume a token if one is available, otherwise return how long until one is.
    fn try_take(&self) -> Result<(), Duration> {
        let mut b = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last_refill).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.capacity);
        b.last_refill = now;

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            b.stats.requests_made += 1;
            return Ok(());
        }

        let wait = Duration::from_secs_f64((1.0 - b.tokens) / self.rate);
        b.stats.requests_throttled += 1;
        b.stats.total_wait += wait;
        debug!(wait_ms = wait.as_millis() as u64, "rate limit throttled");
        Err(wait)
    }

    pub fn stats(&self) -> RateStats {
        self.bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
    }
}
