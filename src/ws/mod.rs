//! Realtime session over a single WebSocket.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: cloneable handle onto the background task that owns the
//!   socket, heartbeat, outbound queue, correlation table and reconnect timer
//! - [`Dispatcher`]: typed publish/subscribe for inbound messages, as callbacks or
//!   as streams
//! - [`types`]: the JSON frame format and lifecycle events
//!
//! Frames are JSON objects `{type, data?, timestamp, id?}`. `ping` frames are
//! answered with `pong`, `pong` frames count as heartbeats, frames whose `id`
//! matches an outstanding request settle that request, and everything else is
//! handed to subscribers.
//!
//! # Example
//!
//! ```rust, no_run
//! use std::time::Duration;
//!
//! use futures::StreamExt as _;
//! use inspection_realtime::ws::{Config, ConnectionManager, MessageKind, OutboundMessage};
//!
//! # async fn run() -> inspection_realtime::Result<()> {
//! let manager = ConnectionManager::new("https://inspect.example.com/ws", Config::default())?;
//! manager.connect("token".to_owned()).await?;
//!
//! let reply = manager
//!     .send_and_wait_for_response(OutboundMessage::new("site_status"), Duration::from_secs(5))
//!     .await?;
//! println!("{:?}", reply.data);
//!
//! let mut notifications = Box::pin(manager.messages(MessageKind::Notification));
//! while let Some(message) = notifications.next().await {
//!     println!("{:?}", message?.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
mod driver;
pub mod endpoint;
pub mod error;
pub mod types;

pub use config::{Config, MAX_TIMER_DURATION, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{Dispatcher, Handler, Route, SubscriptionHandle};
pub use driver::{HEARTBEAT_TIMEOUT_CLOSE_CODE, MANUAL_CLOSE_CODE};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use types::{
    ConnectionEvent, ConnectionStats, ConnectionStatus, InboundMessage, MessageKind,
    OutboundMessage, Topic, parse_frame,
};
