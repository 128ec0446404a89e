//! Circuit breaker guarding calls to the shared store.
//!
//! The breaker is fail-open: when the guarded action fails, or when the
//! circuit is open, the caller receives the fallback value instead of an
//! error. An outage of the store therefore degrades rate limiting to "mostly
//! allow" rather than rejecting all traffic.
//!
//! State is private to one breaker instance and never shared across
//! processes. It sits behind a mutex because a multi-threaded runtime may
//! call [`CircuitBreaker::execute`] from several tasks at once; the lock is
//! never held across an await point.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::BreakerConfig;

/// The current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are skipped and resolved to the fallback.
    Open,
    /// One trial call runs at a time: success closes, failure reopens.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time view of a breaker, for the administrative surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub failure_count: u32,
    /// Time of the most recent failure (ms epoch, zero if none)
    pub last_failure_ms: u64,
    /// Failures needed to open
    pub threshold: u32,
    /// Cooldown before a trial call
    pub cooldown_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_ms: u64,
    /// Start of the half-open trial still awaiting its result
    trial_started_ms: Option<u64>,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_ms: 0,
            trial_started_ms: None,
        }
    }
}

/// A fail-open circuit breaker.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    call_timeout: Option<Duration>,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker from configuration.
    pub fn new(name: impl Into<String>, config: &BreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            threshold: config.threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
            call_timeout: config.call_timeout_ms.map(Duration::from_millis),
            clock,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Run `action` through the breaker.
    ///
    /// If the circuit is open, or half-open with a trial call already in
    /// flight, the action is not invoked and `fallback()` is returned. Otherwise the action runs (bounded by the call timeout, if
    /// configured); its value is returned on success, and on failure the
    /// failure is recorded and `fallback()` is returned. The action's error is
    /// never propagated.
    pub async fn execute<T, E, F, Fut, FB>(&self, action: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        FB: FnOnce() -> T,
    {
        if !self.permit() {
            debug!(breaker = %self.name, "Circuit open, using fallback");
            return fallback();
        }

        let result = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, action()).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("call timed out after {:?}", limit)),
            },
            None => action().await.map_err(|e| e.to_string()),
        };

        match result {
            Ok(value) => {
                self.on_success();
                value
            }
            Err(reason) => {
                self.on_failure(&reason);
                fallback()
            }
        }
    }

    /// Current state, after applying any due open → half-open transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Current state and counters.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_ms: inner.last_failure_ms,
            threshold: self.threshold,
            cooldown_ms: self.cooldown_ms(),
        }
    }

    /// Force the breaker closed and forget all failures.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::default();
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn permit(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let now = self.clock.now_ms();
                // A trial whose caller went away is replaced after one cooldown.
                let busy = inner
                    .trial_started_ms
                    .is_some_and(|started| now.saturating_sub(started) < self.cooldown_ms());
                if busy {
                    return false;
                }
                inner.trial_started_ms = Some(now);
                true
            }
        }
    }

    fn cooldown_ms(&self) -> u64 {
        u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX)
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = self.clock.now_ms().saturating_sub(inner.last_failure_ms);
        if elapsed >= self.cooldown_ms() {
            inner.state = CircuitState::HalfOpen;
            inner.trial_started_ms = None;
            info!(breaker = %self.name, "Circuit half-open, allowing a trial call");
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "Trial call succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_started_ms = None;
    }

    fn on_failure(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_ms = self.clock.now_ms();

        let trips = inner.state == CircuitState::HalfOpen || inner.failure_count >= self.threshold;
        if trips && inner.state != CircuitState::Open {
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                reason = %reason,
                "Circuit opened"
            );
        } else {
            debug!(
                breaker = %self.name,
                failures = inner.failure_count,
                reason = %reason,
                "Guarded call failed"
            );
        }
        if trips {
            inner.state = CircuitState::Open;
        }
        inner.trial_started_ms = None;
    }
}
