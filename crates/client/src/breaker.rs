//! Per-endpoint circuit breaker.
//!
//! Tracks consecutive transient failures against one remote endpoint.
//! After `threshold` failures the circuit opens and calls fail fast
//! with `CircuitOpen` for the cool-down period; then one trial call is
//! admitted (half-open) and the circuit closes on success or reopens
//! on failure.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use warchive_core::Error;

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    /// One trial call is in flight; further calls are rejected until
    /// its outcome is recorded or another cool-down elapses (a trial
    /// whose outcome is never reported must not wedge the circuit).
    HalfOpen { since: Instant },
}

/// Circuit breaker guarding one remote endpoint.
pub struct CircuitBreaker {
    endpoint: String,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            threshold,
            cooldown,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Check admission before issuing a call.
    ///
    /// Fails with `Error::CircuitOpen` while the circuit is open or a
    /// half-open trial is already in flight.
    pub fn check(&self) -> Result<(), Error> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed { .. } => Ok(()),
            State::Open { since } | State::HalfOpen { since } => {
                if since.elapsed() >= self.cooldown {
                    tracing::debug!(endpoint = %self.endpoint, "circuit half-open; admitting trial call");
                    *state = State::HalfOpen { since: Instant::now() };
                    Ok(())
                } else {
                    Err(Error::CircuitOpen { endpoint: self.endpoint.clone() })
                }
            }
        }
    }

    /// Record a successful call, closing the circuit.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if matches!(*state, State::Open { .. } | State::HalfOpen { .. }) {
            tracing::info!(endpoint = %self.endpoint, "circuit closed");
        }
        *state = State::Closed { failures: 0 };
    }

    /// Record a transient failure, opening the circuit once the
    /// threshold is reached.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    tracing::warn!(endpoint = %self.endpoint, failures, "circuit opened");
                    State::Open { since: Instant::now() }
                } else {
                    State::Closed { failures }
                }
            }
            State::HalfOpen { .. } => {
                tracing::warn!(endpoint = %self.endpoint, "trial call failed; circuit reopened");
                State::Open { since: Instant::now() }
            }
            open @ State::Open { .. } => open,
        };
    }

    /// Current state name, for logs and diagnostics.
    pub fn state_name(&self) -> &'static str {
        match *self.state.lock().expect("breaker lock poisoned") {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen { .. } => "half-open",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_admits() {
        let breaker = CircuitBreaker::new("index", 3, Duration::from_secs(30));
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state_name(), "closed");
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("index", 3, Duration::from_secs(30));
        for _ in 0..3 {
            assert!(breaker.check().is_ok());
            breaker.record_failure();
        }
        assert_eq!(breaker.state_name(), "open");
        assert!(matches!(breaker.check(), Err(Error::CircuitOpen { endpoint }) if endpoint == "index"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("index", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state_name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_then_close() {
        let breaker = CircuitBreaker::new("index", 2, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;

        // one trial admitted, concurrent calls still rejected
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state_name(), "half-open");
        assert!(breaker.check().is_err());

        breaker.record_success();
        assert_eq!(breaker.state_name(), "closed");
        assert!(breaker.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("index", 1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state_name(), "open");
        assert!(breaker.check().is_err());
    }
}
