//! Retry and circuit breaking around arbitrary asynchronous work.
//!
//! [`ErrorRecoveryManager::execute`] is the one decision point for retry versus
//! propagate versus trip. Callers pick the protections per call with
//! [`RecoveryOptions`]:
//!
//! - **Retry**: errors whose class is in [`RetryPolicy::retry_on`] are retried with
//!   exponential backoff up to `max_retries`; other errors propagate at once.
//! - **Circuit breaker**: consecutive failed calls open the circuit; while open,
//!   calls fail with [`CircuitOpen`] without running. After the cooldown a single
//!   trial call decides between closing and reopening.
//!
//! # Example
//!
//! ```rust, no_run
//! use inspection_realtime::error::Error;
//! use inspection_realtime::recovery::{
//!     ErrorRecoveryManager, RecoveryConfig, RecoveryHooks, RecoveryOptions,
//! };
//!
//! # async fn run() -> inspection_realtime::Result<()> {
//! let hooks = RecoveryHooks::new()
//!     .on_retry(|error, attempt| eprintln!("retry {attempt}: {error}"))
//!     .on_state_change(|state| eprintln!("breaker is now {state}"));
//! let recovery = ErrorRecoveryManager::with_hooks(RecoveryConfig::default(), hooks);
//!
//! recovery
//!     .execute("psv.list", RecoveryOptions::all(), || async {
//!         Err::<(), _>(Error::server(503, "maintenance"))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod manager;

pub use breaker::{CircuitOpen, CircuitState};
pub use config::{
    CircuitBreakerConfig, ErrorClass, RecoveryConfig, RecoveryOptions, RetryOn, RetryPolicy,
};
pub use manager::{ErrorRecoveryManager, RecoveryHooks};
