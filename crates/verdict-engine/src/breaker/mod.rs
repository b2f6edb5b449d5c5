//! Circuit breakers
//!
//! Failure-isolation state machine guarding calls to unreliable
//! dependencies. One breaker exists per analyzer plus one guarding the
//! engine's own critical path; both kinds live in a [`BreakerRegistry`].
//!
//! - **Closed**: calls pass; consecutive failures are counted, success resets
//! - **Open**: calls fail fast until the recovery interval has elapsed
//! - **Half-open**: a bounded number of trial calls decide the next state

mod registry;

pub use registry::{BreakerRegistry, SYSTEM_BREAKER};

use crate::config::BreakerConfig;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry hint given while half-open trial slots are taken
const HALF_OPEN_RETRY_HINT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// A state change published on the registry's transition channel
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub breaker: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub consecutive_failures: u32,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_success: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    trials_in_flight: u32,
}

/// Circuit breaker for one dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    transitions: Option<broadcast::Sender<BreakerTransition>>,
    total_success: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_at: None,
                last_error: None,
                trials_in_flight: 0,
            }),
            transitions: None,
            total_success: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Publish transitions on `sender`
    pub fn with_transitions(mut self, sender: broadcast::Sender<BreakerTransition>) -> Self {
        self.transitions = Some(sender);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state without triggering the open -> half-open check
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask to make a call. Fails fast with `CircuitOpen` while open.
    ///
    /// The returned permit must be resolved with [`BreakerPermit::success`]
    /// or [`BreakerPermit::failure`]; dropping it unresolved releases a
    /// half-open trial slot without counting an outcome.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit> {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::Open {
            let recovery = self.config.recovery_interval();
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(recovery);
            if elapsed < recovery {
                drop(inner);
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::CircuitOpen {
                    breaker: self.name.clone(),
                    retry_after: recovery - elapsed,
                });
            }
            self.transition(&mut inner, BreakerState::HalfOpen, Some("recovery interval elapsed".to_string()));
        }

        if inner.state == BreakerState::HalfOpen {
            if inner.trials_in_flight >= self.config.half_open_max_calls {
                drop(inner);
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::CircuitOpen {
                    breaker: self.name.clone(),
                    retry_after: HALF_OPEN_RETRY_HINT.min(self.config.recovery_interval()),
                });
            }
            inner.trials_in_flight += 1;
            debug!(breaker = %self.name, trials = inner.trials_in_flight, "Half-open trial call admitted");
            return Ok(BreakerPermit::new(Arc::clone(self), true));
        }

        Ok(BreakerPermit::new(Arc::clone(self), false))
    }

    fn record_success(&self, trial: bool) {
        self.total_success.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                self.transition(&mut inner, BreakerState::Closed, Some("trial call succeeded".to_string()));
            }
            BreakerState::Open => {
                // a call admitted before the circuit opened; the open state stands
                debug!(breaker = %self.name, "Late success ignored while open");
            }
        }
    }

    fn record_failure(&self, trial: bool, error: &str) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());
        inner.last_error = Some(error.to_string());

        match inner.state {
            BreakerState::Closed => {
                debug!(
                    breaker = %self.name,
                    consecutive = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Call failed in closed state"
                );
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    let reason = format!(
                        "{} consecutive failures reached threshold {}",
                        inner.consecutive_failures, self.config.failure_threshold
                    );
                    self.transition(&mut inner, BreakerState::Open, Some(reason));
                }
            }
            BreakerState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                inner.trials_in_flight = 0;
                self.transition(&mut inner, BreakerState::Open, Some(format!("trial call failed: {}", error)));
            }
            BreakerState::Open => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, reason: Option<String>) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            BreakerState::Open => warn!(
                breaker = %self.name,
                from = from.as_str(),
                consecutive_failures = inner.consecutive_failures,
                reason = reason.as_deref().unwrap_or(""),
                "Circuit breaker opened"
            ),
            _ => info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker transition"
            ),
        }

        if let Some(tx) = &self.transitions {
            // no subscribers is fine
            let _ = tx.send(BreakerTransition {
                breaker: self.name.clone(),
                from,
                to,
                consecutive_failures: inner.consecutive_failures,
                reason,
                at: Utc::now(),
            });
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let next_retry_at = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(at)) => {
                let remaining = self.config.recovery_interval().saturating_sub(at.elapsed());
                chrono::Duration::from_std(remaining)
                    .ok()
                    .map(|d| Utc::now() + d)
            }
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            next_retry_at,
            last_error: inner.last_error.clone(),
            total_success: self.total_success.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Admission to call through a breaker
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this call is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self, error: &str) {
        self.resolved = true;
        self.breaker.record_failure(self.trial, error);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}
