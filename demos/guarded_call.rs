//! Retry and circuit breaking around a flaky call.
//!
//! The simulated service fails twice with a 503 and then answers. A second service
//! always fails and trips the breaker.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example guarded_call --features tracing
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use inspection_realtime::error::Error;
use inspection_realtime::recovery::{
    CircuitBreakerConfig, ErrorRecoveryManager, RecoveryConfig, RecoveryHooks, RecoveryOptions,
    RetryPolicy,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = RecoveryConfig::builder()
        .retry(
            RetryPolicy::builder()
                .max_retries(3)
                .backoff_base(Duration::from_millis(200))
                .build(),
        )
        .circuit_breaker(
            CircuitBreakerConfig::builder()
                .failure_threshold(2)
                .cooldown(Duration::from_secs(5))
                .build(),
        )
        .build();
    let hooks = RecoveryHooks::new()
        .on_retry(|error, attempt| warn!(attempt, error = %error, "retrying"))
        .on_state_change(|state| info!(%state, "breaker changed"))
        .on_max_retries_reached(|error| warn!(error = %error, "out of retries"));
    let recovery = ErrorRecoveryManager::with_hooks(config, hooks);

    let calls = Arc::new(AtomicU32::new(0));
    let findings = recovery
        .execute("findings.list", RecoveryOptions::all(), || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::server(503, "maintenance"))
                } else {
                    Ok(vec!["corrosion on PSV-1042", "missing tag on V-201"])
                }
            }
        })
        .await?;
    info!(?findings, retries = recovery.retry_count());

    for _ in 0..4 {
        let result = recovery
            .execute("reports.export", RecoveryOptions::all(), || async {
                Err::<(), _>(Error::network("connection reset"))
            })
            .await;
        if let Err(e) = result {
            warn!(kind = ?e.kind(), error = %e, breaker = %recovery.circuit_breaker_state());
        }
    }

    for record in recovery.error_history() {
        info!(context = %record.context, kind = ?record.kind, message = %record.message);
    }

    Ok(())
}
