use std::{collections::VecDeque, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::BreakerConfig;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,

    /// Calls are rejected until the reset timeout elapses.
    Open,

    /// A single trial call is admitted.
    HalfOpen,
}

/// A per-key guard that stops invoking a chronically failing operation for a cooldown period.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    failures: VecDeque<Instant>,
    successes: u64,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_activity: Instant,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            successes: 0,
            opened_at: None,
            trial_in_flight: false,
            last_activity: now,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Returns the number of failures counted in the current window.
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Returns the number of successes since the counters were last reset.
    pub fn success_count(&self) -> u64 {
        self.successes
    }

    /// Asks to admit one call.
    ///
    /// An open breaker moves to half-open once `reset_timeout` has elapsed and admits exactly one
    /// trial until that trial is recorded.
    pub fn try_acquire(&mut self, config: &BreakerConfig, now: Instant) -> bool {
        self.last_activity = now;
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed < *config.get_reset_timeout() {
                    return false;
                }

                tracing::info!("circuit breaker half-open after {elapsed:?}");
                self.state = BreakerState::HalfOpen;
                self.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful call. A half-open breaker closes with its failures cleared.
    pub fn record_success(&mut self, now: Instant) {
        self.last_activity = now;
        self.successes += 1;
        if self.state != BreakerState::Closed {
            self.state = BreakerState::Closed;
            self.failures.clear();
            self.opened_at = None;
            self.trial_in_flight = false;
        }
    }

    /// Records a failed call. Returns `true` if the breaker opened because of it.
    pub fn record_failure(&mut self, config: &BreakerConfig, now: Instant) -> bool {
        self.last_activity = now;
        match self.state {
            BreakerState::HalfOpen => {
                self.open(now);
                true
            }
            BreakerState::Open => false,
            BreakerState::Closed => {
                self.failures.push_back(now);
                self.prune(config, now);
                if self.failures.len() >= *config.get_failure_threshold() as usize {
                    self.open(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Gives up a half-open trial whose outcome will never be recorded.
    ///
    /// The breaker reopens and admits the next trial after another `reset_timeout`.
    pub fn abandon_trial(&mut self, now: Instant) {
        self.last_activity = now;
        if self.state == BreakerState::HalfOpen && self.trial_in_flight {
            self.open(now);
        }
    }

    /// Returns `true` if the breaker is closed and has seen no activity for `idle_reset`.
    pub fn is_idle(&self, config: &BreakerConfig, now: Instant) -> bool {
        self.state == BreakerState::Closed
            && now.saturating_duration_since(self.last_activity) >= *config.get_idle_reset()
    }

    /// Zeroes the failure and success counters.
    pub fn reset_counters(&mut self) {
        self.failures.clear();
        self.successes = 0;
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }

    fn prune(&mut self, config: &BreakerConfig, now: Instant) {
        let window = *config.get_monitoring_window();
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        };
        write!(f, "{state}")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
