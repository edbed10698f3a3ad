//! Circuit breaker guarding control-plane calls

use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half_open",
            BreakerState::Open => "open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    /// Start of the half-open trial currently in flight
    trial_started: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
///
/// Opens after `threshold` consecutive failures. While open, requests are
/// rejected until `timeout` has elapsed since the last failure, after which
/// one trial request moves the breaker to half-open. Only that trial is
/// admitted while half-open; a trial that never reports an outcome frees the
/// slot after another `timeout`. A success closes the breaker; a failure
/// while half-open reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                trial_started: None,
            }),
        }
    }

    /// Whether a request would currently be admitted. Does not change state.
    pub fn can_request(&self) -> bool {
        let inner = self.inner.read();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => self.trial_slot_free(&inner),
            BreakerState::Open => self.cooldown_elapsed(&inner),
        }
    }

    /// Admit a request, moving Open to HalfOpen once the cooldown elapsed.
    pub fn try_acquire(&self) -> bool {
        if !self.can_request() {
            return false;
        }

        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen if self.trial_slot_free(&inner) => {
                inner.trial_started = Some(Instant::now());
                true
            }
            BreakerState::HalfOpen => false,
            BreakerState::Open if self.cooldown_elapsed(&inner) => {
                inner.state = BreakerState::HalfOpen;
                inner.trial_started = Some(Instant::now());
                info!("Circuit breaker half-open, allowing trial request");
                true
            }
            BreakerState::Open => false,
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.write();
        if inner.state != BreakerState::Closed {
            info!("Circuit breaker closed");
        }
        inner.failures = 0;
        inner.state = BreakerState::Closed;
        inner.trial_started = None;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.write();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_started = None;

        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.failures >= self.threshold,
            BreakerState::Open => false,
        };

        if should_open {
            inner.state = BreakerState::Open;
            warn!(
                failures = inner.failures,
                cooldown_secs = self.timeout.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.read().failures
    }

    fn cooldown_elapsed(&self, inner: &Inner) -> bool {
        inner
            .last_failure
            .map(|at| at.elapsed() >= self.timeout)
            .unwrap_or(true)
    }

    fn trial_slot_free(&self, inner: &Inner) -> bool {
        inner
            .trial_started
            .map(|at| at.elapsed() >= self.timeout)
            .unwrap_or(true)
    }
}
