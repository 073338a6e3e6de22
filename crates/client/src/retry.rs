//! Retry driver for outbound calls.
//!
//! Each call moves through an explicit state machine:
//! `Pending -> Retrying -> Waiting(backoff) -> Retrying -> ...`
//! ending in `Succeeded` or `Failed`. Only transient failures are
//! retried; everything else surfaces immediately. The per-endpoint
//! circuit breaker is consulted before every attempt and fed every
//! outcome.

use std::time::Duration;

use warchive_core::Error;
use warchive_core::config::RateConfig;

use crate::breaker::CircuitBreaker;

/// Backoff schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(10) }
    }
}

impl From<&RateConfig> for RetryPolicy {
    fn from(cfg: &RateConfig) -> Self {
        Self { max_attempts: cfg.max_retries, base_delay: cfg.backoff_base(), max_delay: cfg.backoff_cap() }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter for the given (1-based) attempt.
    ///
    /// The delay doubles per attempt up to `max_delay`; the jittered
    /// result lies in `[delay/2, delay]` so concurrent retries spread
    /// out.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        jitter(capped)
    }
}

fn jitter(delay: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let frac = f64::from(nanos % 1_000) / 1_000.0;
    delay / 2 + Duration::from_secs_f64(delay.as_secs_f64() * 0.5 * frac)
}

/// Lifecycle of one governed outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    Retrying { attempt: u32 },
    Waiting { attempt: u32 },
    Succeeded,
    Failed,
}

/// Drive `f` through the retry state machine.
///
/// `f` receives the 1-based attempt number. Transient errors are
/// retried with backoff up to `policy.max_attempts` and then surfaced
/// carrying the attempt count; all other errors surface immediately.
/// The breaker rejects the whole call with `CircuitOpen` while open.
pub async fn run<T, F, Fut>(
    policy: &RetryPolicy, breaker: &CircuitBreaker, op: &str, mut f: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut state = RetryState::Pending;
    let mut attempt = 1;
    tracing::trace!(op, ?state, "call pending");

    loop {
        breaker.check()?;
        state = RetryState::Retrying { attempt };
        tracing::trace!(op, attempt, ?state, "issuing attempt");

        match f(attempt).await {
            Ok(value) => {
                breaker.record_success();
                state = RetryState::Succeeded;
                tracing::trace!(op, attempt, ?state, "attempt succeeded");
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                breaker.record_failure();
                let delay = policy.backoff_delay(attempt);
                state = RetryState::Waiting { attempt };
                tracing::debug!(op, attempt, ?delay, error = %e, ?state, "transient failure; backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(Error::Transient { context, .. }) => {
                breaker.record_failure();
                state = RetryState::Failed;
                tracing::warn!(op, attempt, ?state, "transient failure; attempts exhausted");
                return Err(Error::Transient { context, attempts: attempt });
            }
            Err(e) => {
                // the endpoint answered, just not with what we wanted
                if matches!(e, Error::NotFound { .. } | Error::InvalidQuery { .. } | Error::Http { .. }) {
                    breaker.record_success();
                }
                state = RetryState::Failed;
                tracing::debug!(op, attempt, error = %e, ?state, "non-retryable failure");
                return Err(e);
            }
        }
    }
}
