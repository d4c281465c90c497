//! Retry with exponential backoff and jitter for any fallible async operation.
//!
//! The policy is a plain value handed to [`execute`] at the call site. The
//! executor performs no I/O of its own; it only awaits the closure and sleeps
//! between attempts.
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config;

pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter_fraction: f64,
    retryable: Option<RetryPredicate<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            exponential_base: self.exponential_base,
            jitter_fraction: self.jitter_fraction,
            retryable: self.retryable.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential_base", &self.exponential_base)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("has_predicate", &self.retryable.is_some())
            .finish()
    }
}

impl<E> RetryPolicy<E> {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            exponential_base: 2.0,
            jitter_fraction: 0.0,
            retryable: None,
        }
    }

    pub fn from_config(cfg: &config::Retry) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            initial_delay: cfg.initial_delay(),
            max_delay: cfg.max_delay(),
            exponential_base: cfg.exponential_base,
            jitter_fraction: cfg.jitter_fraction,
            retryable: None,
        }
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Only errors for which `predicate` returns true are retried.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    pub fn is_retryable(&self, err: &E) -> bool {
        self.retryable.as_ref().map_or(true, |p| p(err))
    }

    /// Delay before attempt `attempt` (1-based retry number), before jitter:
    /// `min(initial * base^(attempt-1), max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exp);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Inflate `delay` by a uniform random share of up to `jitter_fraction`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 || delay.is_zero() {
            return delay;
        }
        let noise: f64 = rand::thread_rng().gen_range(0.0..=self.jitter_fraction);
        delay + Duration::from_secs_f64(delay.as_secs_f64() * noise)
    }
}

/// The last error of a failed operation, annotated with how many attempts
/// were made.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub operation: String,
    pub attempts: u32,
    pub source: E,
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn into_inner(self) -> E {
        self.source
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or
/// `policy.max_attempts` attempts have been made.
pub async fn execute<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.is_retryable(&err) {
                    debug!(operation, attempt, error = %err, "non-retryable error");
                    return Err(RetryError {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
                if attempt >= max_attempts {
                    warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                    return Err(RetryError {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
                let delay = policy.jittered(policy.backoff_delay(attempt));
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
