//! Realtime session walkthrough.
//!
//! This example:
//! 1. Creates a session manager for the endpoint in `REALTIME_URL`
//! 2. Logs lifecycle events (connects, disconnects, reconnect scheduling)
//! 3. Subscribes to notifications with a callback and a stream
//! 4. Issues one correlated request
//! 5. Disconnects manually
//!
//! Run with tracing enabled:
//! ```sh
//! REALTIME_URL=http://localhost:8000/ws/notifications REALTIME_TOKEN=... \
//!     RUST_LOG=info,inspection_realtime=debug cargo run --example session --features ws,tracing
//! ```

use std::env;
use std::time::Duration;

use futures::StreamExt as _;
use inspection_realtime::ws::{
    Config, ConnectionEvent, ConnectionManager, MessageKind, OutboundMessage,
};
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint =
        env::var("REALTIME_URL").unwrap_or_else(|_| "http://localhost:8000/ws".to_owned());
    let token = env::var("REALTIME_TOKEN")?;

    let manager = ConnectionManager::new(&endpoint, Config::default())?;
    info!(session_id = manager.session_id(), stats = ?manager.stats());

    let mut events = manager.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    warn!(attempt, ?delay, "reconnect scheduled");
                }
                ConnectionEvent::ReconnectExhausted { attempts } => {
                    warn!(attempts, "giving up on reconnects");
                }
                other => info!(event = ?other),
            }
        }
    });

    let _alerts = manager.subscribe("alert_raised", |message| {
        info!(stream = "alert_raised", data = ?message.data);
    });

    manager.connect(token).await?;

    match manager
        .send_and_wait_for_response(
            OutboundMessage::new("site_status").with_data(json!({ "site": "north" })),
            Duration::from_secs(5),
        )
        .await
    {
        Ok(reply) => info!(endpoint = "site_status", data = ?reply.data),
        Err(e) => warn!(endpoint = "site_status", error = %e),
    }

    let mut notifications = Box::pin(manager.messages(MessageKind::Notification));
    let mut count = 0;
    while let Ok(Some(result)) = timeout(Duration::from_secs(30), notifications.next()).await {
        match result {
            Ok(message) => {
                info!(stream = "notification", data = ?message.data);
                count += 1;
                if count >= 5 {
                    break;
                }
            }
            Err(e) => warn!(stream = "notification", error = %e),
        }
    }
    info!(stream = "notification", received = count);

    manager.disconnect().await?;
    info!(stats = ?manager.stats(), status = ?manager.status());

    Ok(())
}
