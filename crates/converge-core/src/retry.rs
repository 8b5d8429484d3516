//! Retry policy
//!
//! Every provider call and every readiness poll goes through a
//! [`RetryPolicy`]. Providers never retry on their own; the policy is a plain
//! value handed to the executor so it can be tested with a fake provider.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Per-attempt timeout; an expired attempt counts as a transient failure
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// A single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            attempt_timeout: None,
        }
    }

    /// Fixed number of attempts with short delays, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            attempt_timeout: None,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// The full delay schedule between attempts
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.backoff(a)).collect()
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// `on_failure` is called for every failed attempt that will be retried,
    /// with the attempt number and the error.
    pub async fn run<T, F, Fut, N>(&self, what: &str, mut op: F, mut on_failure: N) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(u32, &Error),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Provider {
                        provider: "executor".to_string(),
                        message: format!("{} timed out after {:?}", what, limit),
                        transient: true,
                    }),
                },
                None => op(attempt).await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() || attempt >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        what, attempt, attempts, e, delay
                    );
                    on_failure(attempt, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            attempt_timeout: Some(Duration::from_secs(300)),
        }
    }
}
