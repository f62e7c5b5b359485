use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Failures inside `failure_window` that open the breaker.
    pub failure_threshold: u32,
    pub break_duration: Duration,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_trials: u32,
    pub failure_window: Duration,
}

/// Breaker state: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed {
        failures: u32,
        window_start: Option<Instant>,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        trials: u32,
    },
}

impl BreakerState {
    fn closed() -> Self {
        BreakerState::Closed {
            failures: 0,
            window_start: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Result of checking the breaker before a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Breaker is closed, call normally.
    Allowed,
    /// Breaker is half-open and this call is a trial.
    Probe,
    /// Breaker is open, fail fast.
    Rejected,
}

/// One breaker. Every transition happens under the mutex, so concurrent
/// outcomes are applied one at a time and none is lost.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            state: Mutex::new(BreakerState::closed()),
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        *self.lock()
    }

    pub fn check(&self) -> BreakerCheck {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => BreakerCheck::Allowed,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    *state = BreakerState::HalfOpen { trials: 1 };
                    tracing::info!("circuit_breaker: half-open, admitting trial call");
                    BreakerCheck::Probe
                } else {
                    BreakerCheck::Rejected
                }
            }
            BreakerState::HalfOpen { trials } => {
                if trials < self.settings.half_open_trials {
                    *state = BreakerState::HalfOpen { trials: trials + 1 };
                    BreakerCheck::Probe
                } else {
                    BreakerCheck::Rejected
                }
            }
        }
    }

    pub fn record_success(&self, probe: bool) {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => *state = BreakerState::closed(),
            BreakerState::HalfOpen { .. } if probe => {
                *state = BreakerState::closed();
                tracing::info!("circuit_breaker: closed (trial call succeeded)");
            }
            // Late results from calls admitted before the breaker opened.
            BreakerState::HalfOpen { .. } | BreakerState::Open { .. } => {}
        }
    }

    /// Returns `true` when this failure opened the breaker.
    pub fn record_failure(&self, probe: bool) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        match *state {
            BreakerState::Closed {
                failures,
                window_start,
            } => {
                let (failures, window_start) = match window_start {
                    Some(start) if now.duration_since(start) <= self.settings.failure_window => {
                        (failures + 1, start)
                    }
                    _ => (1, now),
                };
                if failures >= self.settings.failure_threshold {
                    *state = BreakerState::Open {
                        until: now + self.settings.break_duration,
                    };
                    tracing::warn!(
                        "circuit_breaker: opened (after {} failures)",
                        failures
                    );
                    true
                } else {
                    *state = BreakerState::Closed {
                        failures,
                        window_start: Some(window_start),
                    };
                    false
                }
            }
            BreakerState::HalfOpen { .. } if probe => {
                *state = BreakerState::Open {
                    until: now + self.settings.break_duration,
                };
                tracing::warn!("circuit_breaker: re-opened (trial call failed)");
                true
            }
            BreakerState::HalfOpen { .. } | BreakerState::Open { .. } => false,
        }
    }
}

/// Breakers keyed by scope (route key, or route key plus backend).
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, scope: &str, settings: &BreakerSettings) -> Arc<CircuitBreaker> {
        // Fast path: key already exists, no allocation.
        if let Some(entry) = self.breakers.get(scope) {
            return entry.value().clone();
        }
        self.breakers
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(*settings)))
            .clone()
    }

    pub fn state(&self, scope: &str) -> Option<BreakerState> {
        self.breakers.get(scope).map(|b| b.state())
    }

    pub fn clear(&self) {
        self.breakers.clear();
    }
}
