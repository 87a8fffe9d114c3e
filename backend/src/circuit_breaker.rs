//! Circuit Breaker
//!
//! One breaker guards each upstream price source. It stops calling a source
//! that keeps failing and lets a single trial call through once the cooldown has
//! passed.
//!
//! # State machine
//! ```text
//!            ≥ threshold consecutive failures
//!   Closed ───────────────────────────────────→ Open
//!     ↑                                          │ ↑
//!     │ trial success          cooldown elapsed  │ │ trial failure
//!     │                                          ↓ │
//!     └──────────────────────────────────── HalfOpen
//! ```
//!
//! All mutation happens under one mutex, so concurrent callers racing
//! through an expired cooldown see exactly one of them admitted as the trial.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::types::SourceId;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker thresholds and timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a trial call
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Read-only snapshot of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerMetrics {
    pub source: SourceId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,

    /// Calls refused without touching the network
    pub rejected_calls: u64,

    /// Every admission decision, admitted or refused
    pub request_count: u64,

    /// Mean duration of settled calls, 0 before the first one
    pub average_response_time_ms: f64,

    pub is_healthy: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_state_change: Option<DateTime<Utc>>,
}

/// How a permit was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Normal call through a closed circuit
    Regular,

    /// The HalfOpen recovery trial with this generation number
    Trial(u64),
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    request_count: u64,
    timed_calls: u64,
    total_response_time: Duration,
    opened_at: Option<Instant>,
    trial_in_flight: bool,

    /// Bumped on every trial admission; survives `reset`
    trial_generation: u64,

    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_state_change: Option<DateTime<Utc>>,
}

impl BreakerState {
    /// Does `admission` hold the trial slot that is currently in flight?
    ///
    /// `None` is a bare `on_success`/`on_failure` call, which speaks for
    /// whatever call the breaker is waiting on.
    fn owns_trial(&self, admission: Option<Admission>) -> bool {
        if self.state != CircuitState::HalfOpen || !self.trial_in_flight {
            return false;
        }
        match admission {
            None => true,
            Some(Admission::Trial(generation)) => generation == self.trial_generation,
            Some(Admission::Regular) => false,
        }
    }

    fn record_response_time(&mut self, elapsed: Option<Duration>) {
        if let Some(elapsed) = elapsed {
            self.timed_calls += 1;
            self.total_response_time += elapsed;
        }
    }
}

/// Thread-safe circuit breaker for one price source
#[derive(Debug)]
pub struct CircuitBreaker {
    source: SourceId,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(source: SourceId, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            config,
            clock,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// May the caller contact the source right now?
    ///
    /// - Closed: always
    /// - Open: only once the cooldown has elapsed, which moves the breaker to
    ///   HalfOpen and hands the single trial slot to this caller
    /// - HalfOpen: only if the trial slot is free
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Like [`allow`](Self::allow), but hands back a permit that must be
    /// settled.
    ///
    /// Only the permit that took the HalfOpen trial slot can close or reopen
    /// the circuit, or free the slot when dropped unsettled. A permit left
    /// over from before the circuit opened only updates the counters.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let admission = self.admit()?;
        Some(CallPermit {
            breaker: self,
            admission,
            started: self.clock.now(),
            settled: false,
        })
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.lock();
        inner.request_count += 1;

        let state = inner.state;
        let admission = match state {
            CircuitState::Closed => Some(Admission::Regular),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened_at| {
                        self.clock.now().saturating_duration_since(opened_at) >= self.config.cooldown
                    })
                    .unwrap_or(true);

                if cooled_down {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    Some(Self::start_trial(&mut inner))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    Some(Self::start_trial(&mut inner))
                }
            }
        };

        if admission.is_none() {
            inner.rejected_calls += 1;
        }
        admission
    }

    fn start_trial(inner: &mut BreakerState) -> Admission {
        inner.trial_in_flight = true;
        inner.trial_generation += 1;
        Admission::Trial(inner.trial_generation)
    }

    pub fn on_success(&self) {
        self.record_success(None, None);
    }

    pub fn on_failure(&self) {
        self.record_failure(None, None);
    }

    fn record_success(&self, admission: Option<Admission>, elapsed: Option<Duration>) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.total_successes += 1;
        inner.last_success_at = Some(Utc::now());
        inner.record_response_time(elapsed);

        if inner.owns_trial(admission) {
            inner.trial_in_flight = false;
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    fn record_failure(&self, admission: Option<Admission>, elapsed: Option<Duration>) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.total_failures += 1;
        inner.last_failure_at = Some(Utc::now());
        inner.record_response_time(elapsed);

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(self.clock.now());
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        "{} circuit opened after {} consecutive failures",
                        self.source, inner.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                if inner.owns_trial(admission) {
                    inner.trial_in_flight = false;
                    inner.opened_at = Some(self.clock.now());
                    self.transition(&mut inner, CircuitState::Open);
                    info!("{} recovery trial failed, reopening circuit", self.source);
                } else {
                    debug!("{} late failure while trial in flight, counted only", self.source);
                }
            }
            CircuitState::Open => {
                // Late failure from a call admitted before the circuit opened
                inner.opened_at = Some(self.clock.now());
            }
        }
    }

    /// Forget about a call that never reported back.
    fn on_abandoned(&self, admission: Admission) {
        let mut inner = self.lock();
        if inner.owns_trial(Some(admission)) {
            inner.trial_in_flight = false;
            info!("{} trial call abandoned, releasing trial slot", self.source);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.lock();
        let average_response_time_ms = if inner.timed_calls > 0 {
            inner.total_response_time.as_micros() as f64 / 1000.0 / inner.timed_calls as f64
        } else {
            0.0
        };

        CircuitBreakerMetrics {
            source: self.source,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            request_count: inner.request_count,
            average_response_time_ms,
            is_healthy: inner.state != CircuitState::Open,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            last_state_change: inner.last_state_change,
        }
    }

    /// Force Closed with zeroed counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        // Permits from before the reset must never match a later trial
        let trial_generation = inner.trial_generation;
        *inner = BreakerState {
            trial_generation,
            ..BreakerState::default()
        };
        info!("{} circuit breaker manually reset", self.source);
    }

    fn transition(&self, inner: &mut BreakerState, next: CircuitState) {
        let previous = inner.state;
        inner.state = next;
        inner.last_state_change = Some(Utc::now());
        info!("{} circuit breaker: {} → {}", self.source, previous, next);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`]
///
/// Settling it records the outcome and the call duration. Dropping it
/// unsettled (a cancelled request) records nothing and frees the trial slot
/// if this permit held it.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    started: Instant,
    settled: bool,
}

impl CallPermit<'_> {
    /// Is this the HalfOpen recovery trial?
    pub fn is_trial(&self) -> bool {
        matches!(self.admission, Admission::Trial(_))
    }

    pub fn succeed(mut self) {
        self.settled = true;
        let elapsed = self.elapsed();
        self.breaker.record_success(Some(self.admission), Some(elapsed));
    }

    pub fn fail(mut self) {
        self.settled = true;
        let elapsed = self.elapsed();
        self.breaker.record_failure(Some(self.admission), Some(elapsed));
    }

    fn elapsed(&self) -> Duration {
        self.breaker.clock.now().saturating_duration_since(self.started)
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.admission);
        }
    }
}
