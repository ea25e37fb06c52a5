//! Per-cluster circuit breaker.
//!
//! Closed → Open when consecutive failures reach the failure threshold;
//! Open → HalfOpen once the open timeout has elapsed (checked on `allow`);
//! HalfOpen → Closed after enough successes, or back to Open on renewed
//! failures. All transitions are serialized by the breaker's own mutex and
//! reported through an optional observer callback.
use std::{
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Breaker states. `Open` fast-fails admission; `HalfOpen` lets probes
/// through while counting successes toward recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Invoked under the breaker lock on every real state change with
/// `(name, from, to)`. Keep it cheap.
pub type StateChangeObserver = Box<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker guarding one upstream cluster.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
    inner: Mutex<BreakerInner>,
    on_state_change: Mutex<Option<StateChangeObserver>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout", &self.open_timeout)
            .field("inner", &self.inner)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        open_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            success_threshold,
            open_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
            on_state_change: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the state-change observer. Replaces any previous one.
    pub fn set_on_state_change(&self, observer: StateChangeObserver) {
        *self
            .on_state_change
            .lock()
            .expect("breaker observer poisoned") = Some(observer);
    }

    /// Admission check. May transition Open → HalfOpen when the open timeout
    /// has elapsed, so the timeout comparison happens under the lock.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("breaker state poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed_enough = inner
                    .last_failure
                    .is_some_and(|t| now.duration_since(t) >= self.open_timeout);
                if elapsed_enough {
                    inner.success_count = 0;
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    /// Record a successful upstream exchange (status < 500, no transport
    /// error). Denied admissions must not be recorded.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker state poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed upstream exchange.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("breaker state poisoned");
        inner.failure_count += 1;
        inner.last_failure = Some(now);

        if inner.failure_count >= self.failure_threshold && inner.state != BreakerState::Open {
            self.transition(&mut inner, BreakerState::Open);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker state poisoned").state
    }

    // Must be called with the state lock held; no-op is prevented by callers
    // (observers never see self-transitions).
    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        if let Some(observer) = self
            .on_state_change
            .lock()
            .expect("breaker observer poisoned")
            .as_ref()
        {
            observer(&self.name, from, to);
        }
    }
}
