//! Circuit breaker guarding backend submissions.
//!
//! After a configured number of consecutive unavailable results the
//! breaker opens and rejects new submissions for a cooldown window.
//! The first check after the cooldown moves it to half-open, which
//! admits exactly one trial submission: success closes the breaker,
//! failure re-opens it with the cooldown reset. All state lives
//! behind one mutex (single-writer guarantee).

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of breaker state, for logging and tests.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    status: BreakerStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A half-open trial submission is currently in flight.
    trial_in_flight: bool,
}

/// Rejection issued while the breaker is open.
#[derive(Debug, thiserror::Error)]
#[error("Circuit breaker open: backend unavailable for the last {consecutive_failures} submissions")]
pub struct BreakerRejected {
    pub consecutive_failures: u32,
}

/// Fail-fast guard around backend submissions.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                status: BreakerStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold,
            cooldown,
        }
    }

    /// Ask permission to submit. `Ok` either means the breaker is
    /// closed or this caller holds the single half-open trial slot.
    pub fn check(&self) -> Result<(), BreakerRejected> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.status {
            BreakerStatus::Closed => Ok(()),
            BreakerStatus::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    inner.status = BreakerStatus::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("Circuit breaker half-open, allowing one trial submission");
                    Ok(())
                } else {
                    Err(BreakerRejected {
                        consecutive_failures: inner.consecutive_failures,
                    })
                }
            }
            BreakerStatus::HalfOpen => {
                if inner.trial_in_flight {
                    Err(BreakerRejected {
                        consecutive_failures: inner.consecutive_failures,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful submission.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.status != BreakerStatus::Closed {
            tracing::info!("Circuit breaker closing after successful submission");
        }
        inner.status = BreakerStatus::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record an unavailable result.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;
        let should_open = inner.status == BreakerStatus::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if should_open && inner.status != BreakerStatus::Open {
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "Circuit breaker opening",
            );
        }
        if should_open {
            inner.status = BreakerStatus::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Current state, for logging and tests.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        BreakerSnapshot {
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}
