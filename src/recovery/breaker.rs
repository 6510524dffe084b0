//! Three-state circuit breaker.
//!
//! ```text
//! Closed   -> Open      failures >= threshold
//! Open     -> HalfOpen  cooldown elapsed since the last failure
//! HalfOpen -> Closed    trial call succeeded
//! HalfOpen -> Open      trial call failed (cooldown restarts)
//! ```
//!
//! The breaker itself is a plain state machine; [`super::ErrorRecoveryManager`]
//! owns one behind a lock and feeds it outcomes.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::config::CircuitBreakerConfig;
use crate::error::{Error, Kind};

#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow through normally
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// A single trial call is allowed through
    HalfOpen,
}

/// The breaker rejected a call without running it.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    /// Time until a trial call will be admitted. Zero while a trial is in flight.
    pub retry_after: Duration,
}

impl fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit breaker is open, retry after {:?}", self.retry_after)
    }
}

impl StdError for CircuitOpen {}

impl From<CircuitOpen> for Error {
    fn from(err: CircuitOpen) -> Self {
        Error::with_source(Kind::CircuitOpen, err)
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub(crate) fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub(crate) fn try_acquire(&mut self, now: Instant) -> Result<Admission, CircuitOpen> {
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .map_or(self.config.cooldown, |at| now.saturating_duration_since(at));
                if elapsed >= self.config.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(CircuitOpen {
                        retry_after: self.config.cooldown.saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen if self.trial_in_flight => Err(CircuitOpen {
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    pub(crate) fn on_success(&mut self, admission: Admission) {
        match (self.state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.trial_in_flight = false;
            }
            (CircuitState::Closed, _) => self.failure_count = 0,
            // A call admitted before the circuit opened finished late; it proves nothing
            // about the current state.
            _ => {}
        }
    }

    pub(crate) fn on_failure(&mut self, admission: Admission, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        match (self.state, admission) {
            (CircuitState::Closed, _) if self.failure_count >= self.config.failure_threshold => {
                self.state = CircuitState::Open;
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                self.state = CircuitState::Open;
                self.trial_in_flight = false;
            }
            _ => {}
        }
    }

    /// The trial call was dropped before it produced an outcome.
    pub(crate) fn abandon_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
        self.trial_in_flight = false;
    }
}
