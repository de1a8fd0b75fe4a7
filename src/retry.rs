//! Bounded retries with exponential backoff.
//!
//! Each client that talks to an external system (work queue, lease service,
//! container runtime) retries transient failures locally with a
//! [`RetryPolicy`] before surfacing the error to the supervisor.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{ExecutorError, Result};

/// Delay growth between retries.
///
/// The delay for attempt `n` (0-indexed) is `first * factor^n`, capped at `max`.
/// With `jitter` enabled the delay is drawn uniformly from `[delay/2, delay]`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: false,
        }
    }

    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };

        if !self.jitter || base.is_zero() {
            return base;
        }
        let mut rng = rand::thread_rng();
        let millis = base.as_millis() as u64;
        Duration::from_millis(rng.gen_range(millis / 2..=millis))
    }
}

/// How many times an operation is tried, and how long to wait in between.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Must be at least 1.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff.next(attempt);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ExecutorError::Config(format!(
                "{name}: max_attempts must be at least 1"
            )));
        }
        Ok(())
    }
}
