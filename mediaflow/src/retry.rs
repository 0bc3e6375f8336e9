//! Bounded retry with exponential backoff and jitter.
//!
//! Attempt 1 runs immediately. After failed attempt `n` (with attempts left)
//! the policy sleeps `base * 2^(n-1) + uniform(0, jitter)`, capped at
//! `max_delay`. After `max_attempts` failures the last error is returned
//! exactly as the operation produced it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::errors::StageFailure;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    /// Returns true if the operation may be attempted again.
    fn is_retryable(&self) -> bool;
}

impl Retryable for StageFailure {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Configuration for one retried call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the second attempt, in seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,
    /// Upper bound of the uniform jitter added to every delay, in seconds.
    #[serde(default = "default_jitter")]
    pub jitter_seconds: f64,
    /// Cap on the backoff delay (before jitter), in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_jitter() -> f64 {
    0.5
}

fn default_max_delay() -> f64 {
    300.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_seconds: default_base_delay(),
            jitter_seconds: default_jitter(),
            max_delay_seconds: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget, base delay and jitter.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay_seconds: f64, jitter_seconds: f64) -> Self {
        Self {
            max_attempts,
            base_delay_seconds,
            jitter_seconds,
            ..Self::default()
        }
    }

    /// A policy that never sleeps; useful in tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0.0, 0.0)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the backoff cap.
    #[must_use]
    pub fn with_max_delay_seconds(mut self, seconds: f64) -> Self {
        self.max_delay_seconds = seconds;
        self
    }

    /// Attempt budget, never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff before jitter after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let raw = self.base_delay_seconds.max(0.0) * f64::from(1u32 << exponent);
        secs_to_duration(raw.min(self.max_delay_seconds.max(0.0)))
    }

    /// Full delay (backoff plus jitter) after failed attempt `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt).saturating_add(secs_to_duration(random_jitter(self.jitter_seconds)))
    }
}

/// Converts seconds to a [`Duration`], saturating instead of panicking on
/// negative, NaN or out-of-range values.
pub(crate) fn secs_to_duration(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

/// A uniform draw from `[0, bound)`, or zero when `bound` is not a usable
/// positive number.
pub(crate) fn random_jitter(bound: f64) -> f64 {
    if bound.is_finite() && bound > 0.0 {
        rand::thread_rng().gen_range(0.0..bound)
    } else {
        0.0
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more attempts, give up.
    GiveUp,
    /// The error is not retryable.
    NotRetryable,
}

/// Decides what to do after failed attempt `attempt` (1-based).
#[must_use]
pub fn decide<E: Retryable>(policy: &RetryPolicy, attempt: u32, error: &E) -> RetryDecision {
    if !error.is_retryable() {
        RetryDecision::NotRetryable
    } else if attempt >= policy.attempts() {
        RetryDecision::GiveUp
    } else {
        RetryDecision::Retry(policy.delay(attempt))
    }
}

/// Executes `operation` under `policy`.
///
/// `label` only appears in log lines; error context belongs to the caller.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => match decide(policy, attempt, &error) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        operation = label,
                        attempt,
                        max_attempts = policy.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "{label} failed (attempt {attempt}/{}), retrying",
                        policy.attempts()
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => return Err(error),
            },
        }
    }
}
