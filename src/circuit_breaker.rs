//! Circuit breaker guarding the buffer's backing store.
//!
//! The breaker has three states:
//!
//! - **Closed**: writes are attempted; consecutive failures are counted
//! - **Open**: writes are skipped until the recovery timeout elapses
//! - **HalfOpen**: a trial write is let through to check recovery
//!
//! All state lives behind one mutex, so transitions are linearizable. The
//! half-open trial is best-effort: every `allow()` made while half-open
//! returns true until a trial result is recorded, so a burst of concurrent
//! producers can send more than one trial write. The first recorded result
//! decides the next state.

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the breaker, for health checks
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        crate::metrics::set_circuit_state(CircuitState::Closed);
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                opened_at_wall: None,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // State stays consistent even if a holder panicked mid-update
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a write should be attempted at all
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| self.clock.instant().saturating_duration_since(opened))
                    .unwrap_or(Duration::MAX);

                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    crate::metrics::set_circuit_state(CircuitState::HalfOpen);
                    tracing::info!("Circuit breaker transitioning to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.opened_at_wall = None;
                crate::metrics::set_circuit_state(CircuitState::Closed);
                tracing::info!("Circuit breaker closed after successful trial write");
            }
            // A write started before the circuit opened; it does not count as a trial
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                    tracing::warn!(
                        failure_count = inner.failures,
                        recovery_secs = self.config.recovery_timeout.as_secs(),
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open(&mut inner);
                tracing::warn!("Circuit breaker reopened after failed trial write");
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(self.clock.instant());
        inner.opened_at_wall = Some(self.clock.now());
        crate::metrics::set_circuit_state(CircuitState::Open);
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.failures,
            opened_at: inner.opened_at_wall,
        }
    }
}
