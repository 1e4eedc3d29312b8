//! Retry policy and bounded polling.
//!
//! `RetryPolicy` runs a fallible async operation a bounded number of times.
//! `wait_until` probes for a condition at a fixed interval and gives up after
//! a fixed number of probes or when its cancellation token fires.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { initial, max },
        }
    }

    /// Run `op` until it succeeds, the error is not retryable, or attempts
    /// run out. The last error is returned as-is.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "{label} succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt >= self.max_attempts || !is_retryable(&e) {
                        warn!(attempt, "{label} failed: {e}");
                        return Err(e);
                    }
                    warn!(attempt, max_attempts = self.max_attempts, "{label} failed, retrying: {e}");
                    tokio::time::sleep(self.backoff.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Found,
    NotFound,
    Cancelled,
}

/// Probe `check` up to `max_attempts` times, sleeping `interval` between
/// probes. The first probe happens immediately.
pub async fn wait_until<F, Fut>(
    interval: Duration,
    max_attempts: u32,
    cancel: &CancellationToken,
    mut check: F,
) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=max_attempts.max(1) {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if check().await {
            return PollOutcome::Found;
        }
        if attempt < max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
    PollOutcome::NotFound
}
