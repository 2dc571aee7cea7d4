//! Circuit breaker state machine for a single worker.
//!
//! ```text
//! CLOSED ──(failures ≥ threshold)──▶ OPEN ──(cooldown, quiet)──▶ HALF_OPEN
//!    ▲                                 ▲                            │
//!    └────────(trial succeeds)─────────┼────────────────────────────┤
//!                                      └──────(trial fails)─────────┘
//! ```
//!
//! Pure and synchronous: every transition takes `now` explicitly so that the
//! registry (and tests) control the clock.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use taskgrid_core::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-worker breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    max_trials: u32,

    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    trials_remaining: u32,
    trials_in_flight: u32,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            max_trials: config.half_open_max_trials.max(1),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            trials_remaining: 0,
            trials_in_flight: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Record a failed execution. Returns the new state if it changed.
    pub fn record_failure(&mut self, now: Instant) -> Option<CircuitState> {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);

        match self.state {
            CircuitState::Closed if self.failure_count >= self.failure_threshold => {
                self.open(now);
                Some(CircuitState::Open)
            }
            CircuitState::Closed | CircuitState::Open => None,
            CircuitState::HalfOpen => {
                self.open(now);
                Some(CircuitState::Open)
            }
        }
    }

    /// Record a successful execution. Returns the new state if it changed.
    ///
    /// Only a claimed half-open trial closes the circuit. Any other success
    /// (a straggler dispatched before the trip) just decrements.
    pub fn record_success(&mut self, _now: Instant) -> Option<CircuitState> {
        match self.state {
            CircuitState::HalfOpen if self.trials_in_flight > 0 => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.opened_at = None;
                self.trials_remaining = 0;
                self.trials_in_flight = 0;
                Some(CircuitState::Closed)
            }
            CircuitState::Closed | CircuitState::Open | CircuitState::HalfOpen => {
                self.failure_count = self.failure_count.saturating_sub(1);
                None
            }
        }
    }

    /// Cooldown check. Moves OPEN to HALF_OPEN once the cooldown has elapsed
    /// without further failures; a failure during the cooldown restarts it.
    pub fn attempt_half_open(&mut self, now: Instant) -> Option<CircuitState> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened_at = self.opened_at?;
        if now.saturating_duration_since(opened_at) < self.cooldown {
            return None;
        }

        let failed_during_cooldown = self.last_failure_at.is_some_and(|at| at > opened_at);
        if failed_during_cooldown {
            self.opened_at = Some(now);
            return None;
        }

        self.state = CircuitState::HalfOpen;
        self.trials_remaining = self.max_trials;
        self.trials_in_flight = 0;
        Some(CircuitState::HalfOpen)
    }

    /// Whether the router may consider this worker at all.
    pub fn is_dispatchable(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.trials_remaining > 0,
        }
    }

    /// Claim a dispatch slot. Consumes a trial while half-open.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen if self.trials_remaining > 0 => {
                self.trials_remaining -= 1;
                self.trials_in_flight += 1;
                true
            }
            CircuitState::HalfOpen => false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trials_remaining = 0;
        self.trials_in_flight = 0;
    }

    /// Trials claimed since the last half-open transition.
    pub fn trials_in_flight(&self) -> u32 {
        self.trials_in_flight
    }
}
