//! Circuit breaker guarding calls to a failing downstream.
//!
//! A circuit breaker counts consecutive failures and "opens" once they reach
//! the threshold, so further calls fail fast instead of piling onto a
//! downstream that is already struggling.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through. Consecutive failures are counted.
//! - **Open**: Calls are rejected immediately until `recovery_timeout` has elapsed.
//! - **HalfOpen**: One trial call at a time is let through. `success_threshold`
//!   consecutive successes close the circuit, any failure reopens it.
//!
//! The open to half-open transition is lazy: it happens on the first
//! [`CircuitBreaker::can_execute`] check after the recovery timeout.
//!
//! # Example
//!
//! ```rust
//! use toolguard_core::config::CircuitBreakerPolicy;
//! use toolguard_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     "rest_api",
//!     CircuitBreakerPolicy {
//!         failure_threshold: 5,
//!         recovery_timeout: Duration::from_secs(60),
//!         ..CircuitBreakerPolicy::default()
//!     },
//! );
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(CircuitBreakerError::Open) => println!("Rejected"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use crate::metrics::BreakerMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use toolguard_core::config::CircuitBreakerPolicy;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately
    Open,
    /// Circuit is half-open, testing if the downstream recovered
    HalfOpen,
}

impl State {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Errors from [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, call rejected
    #[error("Circuit breaker is open")]
    Open,
    /// The call exceeded the breaker's call timeout
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),
    /// The call failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl CircuitBreakerState {
    const fn closed() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker for one breaker key.
///
/// Clones share state. State mutation is serialized by a mutex that is never
/// held across an `.await`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    policy: Arc<CircuitBreakerPolicy>,
    state: Arc<Mutex<CircuitBreakerState>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        Self {
            name: Arc::from(name.into()),
            policy: Arc::new(policy),
            state: Arc::new(Mutex::new(CircuitBreakerState::closed())),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Breaker name, used in logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Policy the breaker was created with.
    #[must_use]
    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: State) {
        let from = state.state;
        state.state = to;
        match to {
            State::Open => tracing::warn!(
                breaker = %self.name,
                from = from.as_str(),
                failures = state.consecutive_failures,
                threshold = self.policy.failure_threshold,
                "Circuit breaker transitioning to OPEN"
            ),
            State::HalfOpen | State::Closed => tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state change"
            ),
        }
        BreakerMetrics::record_transition(&self.name, from, to);
    }

    /// Current state, without triggering the lazy open to half-open check.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether a call may go through now.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// here. In half-open a `true` answer reserves the single trial slot, which
    /// is freed by [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or [`release`](Self::release).
    #[must_use]
    pub fn can_execute(&self) -> bool {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let allowed = {
            let mut state = self.lock();
            match state.state {
                State::Closed => true,
                State::Open => {
                    let recovered = state
                        .opened_at
                        .is_none_or(|opened| opened.elapsed() >= self.policy.recovery_timeout);
                    if recovered {
                        state.consecutive_successes = 0;
                        state.trial_in_flight = true;
                        self.transition(&mut state, State::HalfOpen);
                    }
                    recovered
                }
                State::HalfOpen => {
                    if state.trial_in_flight {
                        false
                    } else {
                        state.trial_in_flight = true;
                        true
                    }
                }
            }
        };

        if !allowed {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            BreakerMetrics::record_rejection(&self.name);
            tracing::debug!(breaker = %self.name, "Circuit breaker rejecting call");
        }
        allowed
    }

    /// Check [`can_execute`](Self::can_execute) and wrap the admission in a
    /// permit that releases neutrally if dropped without an outcome.
    #[must_use]
    pub fn try_acquire(&self) -> Option<BreakerPermit> {
        self.can_execute().then(|| BreakerPermit {
            breaker: self.clone(),
            settled: false,
        })
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        BreakerMetrics::record_success(&self.name);

        let mut state = self.lock();
        match state.state {
            State::Closed => {
                state.consecutive_failures = 0;
            }
            State::HalfOpen => {
                state.trial_in_flight = false;
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.policy.success_threshold {
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at = None;
                    self.transition(&mut state, State::Closed);
                }
            }
            // Outcome of a call admitted before the circuit opened.
            State::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        BreakerMetrics::record_failure(&self.name);

        let mut state = self.lock();
        state.last_failure_at = Some(Utc::now());
        match state.state {
            State::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.policy.failure_threshold {
                    state.opened_at = Some(Instant::now());
                    self.transition(&mut state, State::Open);
                }
            }
            State::HalfOpen => {
                state.trial_in_flight = false;
                state.consecutive_failures = 0;
                state.consecutive_successes = 0;
                state.opened_at = Some(Instant::now());
                self.transition(&mut state, State::Open);
            }
            State::Open => {
                state.consecutive_failures += 1;
            }
        }
    }

    /// Neutral outcome: frees a reserved half-open trial, counters untouched.
    pub fn release(&self) {
        let mut state = self.lock();
        if state.state == State::HalfOpen {
            state.trial_in_flight = false;
        }
    }

    /// Reset to closed.
    ///
    /// Useful for testing or manual intervention.
    pub fn reset(&self) {
        let mut state = self.lock();
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
        let from = state.state;
        *state = CircuitBreakerState::closed();
        if from != State::Closed {
            BreakerMetrics::record_transition(&self.name, from, State::Closed);
        }
    }

    /// Call an operation through the circuit breaker.
    ///
    /// The call runs under the policy's `call_timeout` (zero disables it); a
    /// timeout counts as a failure. Dropping the future before it completes
    /// releases the breaker neutrally.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit rejects the call,
    /// `CircuitBreakerError::Timeout` if it exceeds the call timeout, and
    /// `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(CircuitBreakerError::Open);
        };

        let call_timeout = self.policy.call_timeout;
        let outcome = if call_timeout.is_zero() {
            operation().await.map_err(CircuitBreakerError::Inner)
        } else {
            match tokio::time::timeout(call_timeout, operation()).await {
                Ok(result) => result.map_err(CircuitBreakerError::Inner),
                Err(_) => Err(CircuitBreakerError::Timeout(call_timeout)),
            }
        };

        match &outcome {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        outcome
    }

    /// Lifetime totals.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Point-in-time view for debug output.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            name: self.name.to_string(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_failure_at: state.last_failure_at,
            totals: self.metrics(),
        }
    }
}

/// Admission through a [`CircuitBreaker`].
///
/// Consume it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unconsumed (e.g. when the calling future is cancelled) is a
/// neutral outcome.
#[derive(Debug)]
#[must_use = "dropping a permit records nothing"]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    settled: bool,
}

impl BreakerPermit {
    /// Record a successful call.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Record a failed call.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release();
        }
    }
}

/// Totals for circuit breaker monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Total number of admission checks
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: State,
    /// Consecutive failures counted while closed
    pub consecutive_failures: u32,
    /// Consecutive successes counted while half-open
    pub consecutive_successes: u32,
    /// Wall-clock time of the last recorded failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Lifetime totals
    pub totals: CircuitBreakerMetrics,
}

/// Breakers of one strategy, created lazily per breaker key.
///
/// Keys are never shared between strategies: every breaker is named
/// `"<owner>:<key>"`.
#[derive(Debug)]
pub struct BreakerSet {
    owner: String,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerSet {
    /// Empty set for a strategy.
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Breaker for `key`, created on first use.
    ///
    /// A breaker whose policy differs from `policy` (after a configuration
    /// update) is replaced by a fresh, closed one.
    #[must_use]
    pub fn get(&self, key: &str, policy: &CircuitBreakerPolicy) -> CircuitBreaker {
        let mut breakers = self.lock();
        if let Some(existing) = breakers.get(key) {
            if existing.policy() == policy {
                return existing.clone();
            }
            tracing::info!(
                breaker = existing.name(),
                "Circuit breaker policy changed, replacing breaker"
            );
        }
        let breaker = CircuitBreaker::new(format!("{}:{key}", self.owner), policy.clone());
        breakers.insert(key.to_string(), breaker.clone());
        breaker
    }

    /// Snapshots of every breaker, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.lock().values().map(CircuitBreaker::snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for breaker in self.lock().values() {
            breaker.reset();
        }
    }
}
