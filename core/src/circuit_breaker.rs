//! Per-endpoint failure gating (§4.1).
//!
//! Grounded on `original_source/.../backend/core/circuit_breaker.py`'s
//! closed/open/half_open state machine, reimplemented with a single
//! `tokio::sync::Mutex`-guarded state struct in the style of the teacher's
//! per-component mutex (`RobotController`'s `state: RobotState` field in
//! `examples/martyn-saronic-urd/src/controller.rs`), so the gate check and
//! the success/failure recording are atomic with respect to each other.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{RoboticsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerStats {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
    pub consecutive_fail: u32,
    pub state_changes: u64,
}

struct Inner {
    state: CircuitBreakerState,
    stats: CircuitBreakerStats,
    last_fail_at: Option<Instant>,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max_calls: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                stats: CircuitBreakerStats::default(),
                last_fail_at: None,
                half_open_successes: 0,
            }),
        }
    }

    pub async fn state(&self) -> CircuitBreakerState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        self.inner.lock().await.stats.clone()
    }

    /// Gates execution of `op`. See §4.1 of the spec for the exact
    /// closed/open/half_open transition rules.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<std::result::Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        {
            let mut guard = self.inner.lock().await;
            self.admit_or_reject(&mut guard)?;
            guard.stats.total += 1;
        }

        let outcome = op().await;

        let mut guard = self.inner.lock().await;
        match &outcome {
            Ok(_) => self.record_success(&mut guard),
            Err(_) => self.record_failure(&mut guard),
        }
        Ok(outcome)
    }

    fn admit_or_reject(&self, guard: &mut Inner) -> Result<()> {
        match guard.state {
            CircuitBreakerState::Closed => Ok(()),
            CircuitBreakerState::Open => {
                let elapsed = guard
                    .last_fail_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    debug!(breaker = %self.name, "recovery timeout elapsed, probing");
                    guard.state = CircuitBreakerState::HalfOpen;
                    guard.half_open_successes = 0;
                    guard.stats.state_changes += 1;
                    Ok(())
                } else {
                    Err(RoboticsError::CircuitBreakerOpen {
                        name: self.name.clone(),
                        consecutive_failures: guard.stats.consecutive_fail,
                        recovery_timeout_secs: self.recovery_timeout.as_secs_f64(),
                    })
                }
            }
            CircuitBreakerState::HalfOpen => {
                if guard.half_open_successes < self.half_open_max_calls {
                    Ok(())
                } else {
                    Err(RoboticsError::CircuitBreakerOpen {
                        name: self.name.clone(),
                        consecutive_failures: guard.stats.consecutive_fail,
                        recovery_timeout_secs: self.recovery_timeout.as_secs_f64(),
                    })
                }
            }
        }
    }

    fn record_success(&self, guard: &mut Inner) {
        guard.stats.success += 1;
        match guard.state {
            CircuitBreakerState::Closed => {
                guard.stats.consecutive_fail = 0;
            }
            CircuitBreakerState::HalfOpen => {
                guard.half_open_successes += 1;
                if guard.half_open_successes >= self.half_open_max_calls {
                    guard.state = CircuitBreakerState::Closed;
                    guard.stats.consecutive_fail = 0;
                    guard.stats.state_changes += 1;
                    debug!(breaker = %self.name, "probe succeeded, closing");
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn record_failure(&self, guard: &mut Inner) {
        guard.stats.fail += 1;
        guard.stats.consecutive_fail += 1;
        guard.last_fail_at = Some(Instant::now());
        match guard.state {
            CircuitBreakerState::Closed => {
                if guard.stats.consecutive_fail >= self.failure_threshold {
                    warn!(breaker = %self.name, "failure threshold reached, opening");
                    guard.state = CircuitBreakerState::Open;
                    guard.stats.state_changes += 1;
                }
            }
            CircuitBreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, re-opening");
                guard.state = CircuitBreakerState::Open;
                guard.stats.state_changes += 1;
            }
            CircuitBreakerState::Open => {}
        }
    }

    pub async fn force_open(&self) {
        let mut guard = self.inner.lock().await;
        guard.state = CircuitBreakerState::Open;
        guard.last_fail_at = Some(Instant::now());
        guard.stats.state_changes += 1;
    }

    pub async fn force_close(&self) {
        let mut guard = self.inner.lock().await;
        guard.state = CircuitBreakerState::Closed;
        guard.stats.consecutive_fail = 0;
        guard.stats.state_changes += 1;
    }
}
