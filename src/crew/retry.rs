//! Retry with capped exponential backoff for provider rate limiting.
//!
//! The wrapper knows nothing about stages: it retries any async operation
//! whose error reports itself as rate limited, and gives up immediately on
//! every other error.

use async_trait::async_trait;
use std::{fmt, future::Future, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

/// Errors that can tell a transient provider rate limit apart from a real
/// failure.
pub trait RateLimitAware {
    fn is_rate_limited(&self) -> bool;

    /// Wait the provider asked for, if it sent one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// `delay(attempt) = min(base * 2^attempt, cap)`, attempt counted from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff {
                base: Duration::from_secs(10),
                cap: Duration::from_secs(120),
            },
        }
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("rate limited on all {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("{0}")]
    Aborted(E),
}

#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

pub async fn retry_with_backoff<T, E, F, Fut, S>(
    policy: &RetryPolicy,
    sleeper: &S,
    label: &'static str,
    mut operation: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RateLimitAware + fmt::Display,
    S: Sleeper + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt + 1,
                });
            }
            Err(err) if err.is_rate_limited() => {
                if attempt + 1 >= max_attempts {
                    error!(
                        target = "listing.crew",
                        operation = label,
                        attempts = max_attempts,
                        error = %err,
                        "retries_exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: max_attempts,
                        last: err,
                    });
                }
                // A provider hint can stretch the wait up to the cap, never past it.
                let hinted = err.retry_after().unwrap_or_default().min(policy.backoff.cap);
                let delay = policy.backoff.delay(attempt).max(hinted);
                warn!(
                    target = "listing.crew",
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "rate_limited_backing_off"
                );
                crate::metrics::retry_scheduled(label, attempt + 1);
                sleeper.sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!(
                    target = "listing.crew",
                    operation = label,
                    attempt = attempt + 1,
                    error = %err,
                    "operation_failed_without_retry"
                );
                return Err(RetryError::Aborted(err));
            }
        }
    }
}
