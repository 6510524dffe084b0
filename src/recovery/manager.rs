#![expect(
    clippy::module_name_repetitions,
    reason = "Manager types expose their domain in the name for clarity"
)]

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::time::{Instant, sleep};

use super::breaker::{Admission, CircuitBreaker, CircuitState};
use super::config::{RecoveryConfig, RecoveryOptions};
use crate::Result;
use crate::error::{Error, ErrorRecord};

pub type RetryHook = Arc<dyn Fn(&Error, u32) + Send + Sync>;
pub type StateChangeHook = Arc<dyn Fn(CircuitState) + Send + Sync>;
pub type MaxRetriesHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Side-effecting notifications, e.g. for showing a toast.
///
/// Hooks are called outside of any internal lock and must not block.
#[derive(Clone, Default)]
pub struct RecoveryHooks {
    on_retry: Option<RetryHook>,
    on_state_change: Option<StateChangeHook>,
    on_max_retries_reached: Option<MaxRetriesHook>,
}

impl RecoveryHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before each retry with the failure and the 1-based retry number.
    #[must_use]
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error, u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_max_retries_reached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_max_retries_reached = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RecoveryHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryHooks")
            .field("on_retry", &self.on_retry.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_max_retries_reached", &self.on_max_retries_reached.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct RecoveryState {
    breaker: CircuitBreaker,
    last_error: Option<ErrorRecord>,
    retry_count: u32,
    history: VecDeque<ErrorRecord>,
}

#[derive(Debug)]
struct Inner {
    config: RecoveryConfig,
    hooks: RecoveryHooks,
    state: Mutex<RecoveryState>,
}

/// Retry and circuit-breaker guard around asynchronous operations.
///
/// This is the single place that decides between retrying, propagating and tripping
/// the breaker. Handles are cheap to clone and share one breaker and one history.
///
/// # Example
///
/// ```rust, no_run
/// use inspection_realtime::error::Error;
/// use inspection_realtime::recovery::{ErrorRecoveryManager, RecoveryOptions};
///
/// # async fn run() -> inspection_realtime::Result<()> {
/// let recovery = ErrorRecoveryManager::default();
/// let rows = recovery
///     .execute("attendance.list", RecoveryOptions::all(), || async {
///         Ok::<_, Error>(vec!["row"])
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ErrorRecoveryManager {
    inner: Arc<Inner>,
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

impl ErrorRecoveryManager {
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self::with_hooks(config, RecoveryHooks::default())
    }

    #[must_use]
    pub fn with_hooks(config: RecoveryConfig, hooks: RecoveryHooks) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        let history = VecDeque::with_capacity(config.history_capacity);

        Self {
            inner: Arc::new(Inner {
                config,
                hooks,
                state: Mutex::new(RecoveryState {
                    breaker,
                    last_error: None,
                    retry_count: 0,
                    history,
                }),
            }),
        }
    }

    /// Run `operation` under the protections selected by `options`.
    ///
    /// `operation` is called once per attempt. `context` labels the call in the error
    /// history and logs.
    pub async fn execute<T, F, Fut>(
        &self,
        context: &str,
        options: RecoveryOptions,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = if options.circuit_breaker {
            Some(self.admit(context)?)
        } else {
            None
        };

        let policy = &self.inner.config.retry;
        let mut backoff: ExponentialBackoff = policy.into();
        let mut attempt = 0_u32;

        loop {
            match operation().await {
                Ok(value) => {
                    self.lock().retry_count = attempt;
                    if let Some(permit) = permit.take() {
                        permit.settle(true);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    self.remember(&error, context);

                    let retryable = options.retry && policy.should_retry(&error);
                    if retryable && attempt < policy.max_retries {
                        attempt += 1;
                        let delay = backoff
                            .next_backoff()
                            .unwrap_or(policy.backoff_cap)
                            .min(policy.backoff_cap);

                        #[cfg(feature = "tracing")]
                        tracing::debug!(
                            context,
                            attempt,
                            ?delay,
                            error = %error,
                            "Operation failed, retrying"
                        );

                        if let Some(hook) = &self.inner.hooks.on_retry {
                            hook(&error, attempt);
                        }
                        sleep(delay).await;
                        continue;
                    }

                    self.lock().retry_count = attempt;

                    if retryable {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(context, attempt, error = %error, "Retries exhausted");

                        if let Some(hook) = &self.inner.hooks.on_max_retries_reached {
                            hook(&error);
                        }
                    }

                    if let Some(permit) = permit.take() {
                        permit.settle(false);
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Force the breaker closed and forget accumulated failures.
    pub fn reset_circuit_breaker(&self) {
        self.transition(|state| state.breaker.reset());

        #[cfg(feature = "tracing")]
        tracing::info!("Circuit breaker reset");
    }

    #[must_use]
    pub fn circuit_breaker_state(&self) -> CircuitState {
        self.lock().breaker.state()
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().breaker.failure_count()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.lock().last_error.clone()
    }

    /// Retries spent by the most recently finished `execute` call.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    /// Recent failures, oldest first.
    #[must_use]
    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.lock().history.iter().cloned().collect()
    }

    #[must_use]
    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    fn admit(&self, context: &str) -> Result<Permit<'_>> {
        let admission = self.transition(|state| state.breaker.try_acquire(Instant::now()));

        match admission {
            Ok(admission) => Ok(Permit {
                manager: self,
                admission,
                settled: false,
            }),
            Err(rejection) => {
                let error = Error::from(rejection);

                #[cfg(feature = "tracing")]
                tracing::debug!(context, error = %error, "Call rejected by circuit breaker");

                self.remember(&error, context);
                Err(error)
            }
        }
    }

    fn remember(&self, error: &Error, context: &str) {
        let record = error.record(context);
        let capacity = self.inner.config.history_capacity;

        let mut state = self.lock();
        if capacity > 0 {
            while state.history.len() >= capacity {
                state.history.pop_front();
            }
            state.history.push_back(record.clone());
        }
        state.last_error = Some(record);
    }

    /// Apply `f` to the locked state and report a breaker transition, if any, once the
    /// lock is released.
    fn transition<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut RecoveryState) -> R,
    {
        let (result, before, after) = {
            let mut state = self.lock();
            let before = state.breaker.state();
            let result = f(&mut state);
            (result, before, state.breaker.state())
        };

        if before != after {
            #[cfg(feature = "tracing")]
            tracing::info!(from = %before, to = %after, "Circuit breaker state changed");

            if let Some(hook) = &self.inner.hooks.on_state_change {
                hook(after);
            }
        }

        result
    }

    fn lock(&self) -> MutexGuard<'_, RecoveryState> {
        // The state has no invariants spanning a panic, so a poisoned lock is still usable.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission ticket for one `execute` call. Dropping it unsettled (the caller's future
/// was cancelled) frees a half-open trial slot without counting an outcome.
struct Permit<'manager> {
    manager: &'manager ErrorRecoveryManager,
    admission: Admission,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        let admission = self.admission;
        self.manager.transition(|state| {
            if success {
                state.breaker.on_success(admission);
            } else {
                state.breaker.on_failure(admission, Instant::now());
            }
        });
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.manager.lock().breaker.abandon_trial();
        }
    }
}
