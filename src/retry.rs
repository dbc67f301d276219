//! Bounded retry combinators and election backoff.
//!
//! All polling in the supervisor goes through [`RetryPolicy`]: a maximum
//! duration, a fixed interval between attempts, and a predicate deciding
//! whether another attempt is worthwhile.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::controller::error::{Error, Result};

/// Parameters for a bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time budget across all attempts.
    pub max_duration: Duration,
    /// Delay between consecutive attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub const fn new(max_duration: Duration, interval: Duration) -> Self {
        Self {
            max_duration,
            interval,
        }
    }

    /// A policy that makes exactly one attempt.
    pub const fn once() -> Self {
        Self {
            max_duration: Duration::ZERO,
            interval: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds, the error is rejected by `should_retry`, or
/// the policy's time budget is exhausted. The last error is returned.
pub async fn retry<T, F, Fut, P>(policy: &RetryPolicy, mut op: F, should_retry: P) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let deadline = Instant::now() + policy.max_duration;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !should_retry(&e) || Instant::now() + policy.interval > deadline {
                    return Err(e);
                }
                debug!(attempt, error = %e, "Retrying after error");
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// Poll `check` until `predicate` accepts its output or the budget runs out.
///
/// Errors from `check` count as a failed attempt. On timeout the error of
/// the final attempt is returned if it failed, otherwise `Error::Timeout`.
pub async fn poll_until<T, F, Fut, P>(policy: &RetryPolicy, mut check: F, predicate: P) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&T) -> bool,
{
    let deadline = Instant::now() + policy.max_duration;
    loop {
        let failure = match check().await {
            Ok(value) if predicate(&value) => return Ok(value),
            Ok(_) => None,
            Err(e) => Some(e),
        };
        if Instant::now() + policy.interval > deadline {
            return Err(failure.unwrap_or(Error::Timeout(policy.max_duration)));
        }
        tokio::time::sleep(policy.interval).await;
    }
}

/// Capped exponential backoff with jitter, used between failed elections.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a backoff starting at `base` and never exceeding `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Number of consecutive failures recorded.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Upper bound of the next delay without jitter.
    pub fn current_ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.failures.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Record a failure and return the delay before the next attempt.
    ///
    /// The delay lies in `[ceiling / 2, ceiling]` so that simultaneous
    /// losers spread out.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.current_ceiling();
        self.failures = self.failures.saturating_add(1);
        let half = ceiling / 2;
        let spread = ceiling.saturating_sub(half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
