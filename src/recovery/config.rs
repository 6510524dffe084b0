#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bitflags::bitflags;
use bon::Builder;

use crate::error::{Error, Kind};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CAP_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_JITTER: f64 = 0.1;
const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN_DURATION: Duration = Duration::from_secs(60);

const DEFAULT_HISTORY_CAPACITY: usize = 50;

bitflags! {
    /// Error classes a [`RetryPolicy`] is willing to spend its budget on.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RetryOn: u8 {
        /// Never retry.
        const NONE = 0;

        /// Transport failures: refused connections, broken sockets.
        const NETWORK = 1;

        /// Server-class answers such as HTTP 5xx.
        const SERVER = 1 << 1;

        /// Deadlines that expired before an answer arrived.
        const TIMEOUT = 1 << 2;

        /// Everything else (validation, protocol, disconnected).
        const OTHER = 1 << 3;

        /// Failures that usually go away on their own.
        const TRANSIENT = Self::NETWORK.bits() | Self::SERVER.bits() | Self::TIMEOUT.bits();
    }
}

/// Coarse classification used to decide retry eligibility.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    Server,
    Timeout,
    Other,
}

impl ErrorClass {
    #[must_use]
    pub const fn of(kind: Kind) -> Self {
        match kind {
            Kind::Network | Kind::Connection => Self::Network,
            Kind::Server => Self::Server,
            Kind::Timeout => Self::Timeout,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub const fn flag(self) -> RetryOn {
        match self {
            Self::Network => RetryOn::NETWORK,
            Self::Server => RetryOn::SERVER,
            Self::Timeout => RetryOn::TIMEOUT,
            Self::Other => RetryOn::OTHER,
        }
    }
}

/// Bounded retry with exponential backoff.
///
/// The delay before retry `n` (1-based) is `backoff_base * 2^(n-1)`, randomized by
/// `jitter` (a factor in `[0, 1)`) and never longer than `backoff_cap`.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying.
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    #[builder(default = DEFAULT_BACKOFF_BASE_DURATION)]
    pub backoff_base: Duration,
    #[builder(default = DEFAULT_BACKOFF_CAP_DURATION)]
    pub backoff_cap: Duration,
    #[builder(default = DEFAULT_JITTER)]
    pub jitter: f64,
    /// Classes that consume the retry budget. Anything else propagates immediately.
    #[builder(default = RetryOn::TRANSIENT)]
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Whether `error` may be retried under this policy.
    ///
    /// A breaker rejection is never retried: the operation was not even attempted.
    #[must_use]
    pub fn should_retry(&self, error: &Error) -> bool {
        error.kind() != Kind::CircuitOpen
            && self.retry_on.contains(ErrorClass::of(error.kind()).flag())
    }
}

impl From<&RetryPolicy> for ExponentialBackoff {
    fn from(policy: &RetryPolicy) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(policy.backoff_base)
            .with_max_interval(policy.backoff_cap)
            .with_multiplier(RETRY_BACKOFF_MULTIPLIER)
            .with_randomization_factor(policy.jitter.clamp(0.0, 0.99))
            .with_max_elapsed_time(None) // Attempts are bounded by max_retries
            .build()
    }
}

/// Thresholds for the three-state breaker.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed calls that open the circuit.
    #[builder(default = DEFAULT_FAILURE_THRESHOLD)]
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is let through.
    #[builder(default = DEFAULT_COOLDOWN_DURATION)]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct RecoveryConfig {
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Number of entries kept in the error history.
    #[builder(default = DEFAULT_HISTORY_CAPACITY)]
    pub history_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Per-call selection of the protections applied by `execute`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct RecoveryOptions {
    #[builder(default = true)]
    pub retry: bool,
    #[builder(default = true)]
    pub circuit_breaker: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self::all()
    }
}

impl RecoveryOptions {
    #[must_use]
    pub const fn all() -> Self {
        Self {
            retry: true,
            circuit_breaker: true,
        }
    }

    #[must_use]
    pub const fn none() -> Self {
        Self {
            retry: false,
            circuit_breaker: false,
        }
    }

    #[must_use]
    pub const fn retry_only() -> Self {
        Self {
            retry: true,
            circuit_breaker: false,
        }
    }

    #[must_use]
    pub const fn circuit_breaker_only() -> Self {
        Self {
            retry: false,
            circuit_breaker: true,
        }
    }
}
