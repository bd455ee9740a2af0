//! Retry and backoff policies, kept apart from the calls they govern so the
//! schedules can be tested without network or processes.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fixed-delay retry for control-plane calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Runs `call` until it produces a definitive answer. `Err` from the
    /// call means a transport-level failure worth retrying; once the budget
    /// is gone the last failure is reported as `BackendUnavailable`.
    pub async fn run<T, F, Fut>(&self, sleeper: &dyn Sleeper, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, String>>,
    {
        let attempts = self.attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt, attempts, call = what, error = %e, "control-plane request failed");
                    last = e;
                    if attempt < attempts {
                        sleeper.sleep(self.delay).await;
                    }
                }
            }
        }

        Err(Error::BackendUnavailable { attempts, last })
    }
}

/// Linear backoff used by the transcoder stream loop: the n-th consecutive
/// failure waits `min(cap, n)` seconds.
#[derive(Debug, Clone)]
pub struct StreamBackoff {
    pub max_retries: u32,
    pub cap: Duration,
}

impl Default for StreamBackoff {
    fn default() -> Self {
        Self {
            max_retries: 5,
            cap: Duration::from_secs(5),
        }
    }
}

impl StreamBackoff {
    /// `None` once `retry_count` exceeds the budget.
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count == 0 || retry_count > self.max_retries {
            return None;
        }
        Some(Duration::from_secs(retry_count as u64).min(self.cap))
    }
}
