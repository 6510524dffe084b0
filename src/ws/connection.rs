#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use secrecy::SecretString;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use url::Url;
use uuid::Uuid;

use super::config::{Config, MAX_TIMER_DURATION};
use super::dispatcher::{Dispatcher, SubscriptionHandle};
use super::driver::{Command, Driver, Outlets, Snapshot};
use super::endpoint::websocket_base;
use super::error::WsError;
use super::types::{
    ConnectionEvent, ConnectionStats, ConnectionStatus, InboundMessage, OutboundMessage, Topic,
};
use crate::Result;
use crate::error::{Error, ErrorRecord};
use crate::recovery::ErrorRecoveryManager;

/// Broadcast channel capacity for lifecycle events.
const EVENT_CAPACITY: usize = 1024;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Created, never connected
    Idle,
    /// Opening handshake in progress
    Connecting,
    /// Transport open
    Open {
        /// When the transport opened
        since: Instant,
    },
    /// Manual close handshake in progress
    Closing,
    /// Transport closed; a reconnect may be scheduled
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting)
    }
}

/// Owns one authenticated realtime session.
///
/// The manager is a cheap handle onto a background task that holds the socket.
/// That task:
/// - opens the session with the bearer token, through the circuit breaker of the
///   [`ErrorRecoveryManager`]
/// - sends a `ping` every [`Config::heartbeat_interval`] and force-closes the socket
///   when pongs stop arriving
/// - queues [`send`](Self::send)s while closed and flushes them in order on open
/// - correlates [`send_and_wait_for_response`](Self::send_and_wait_for_response)
///   replies by id
/// - reconnects with exponential backoff after any close other than a manual one
///
/// Clones share the session. The task stops once every clone is dropped.
///
/// # Example
///
/// ```rust, no_run
/// use inspection_realtime::ws::{Config, ConnectionManager, OutboundMessage, Topic};
///
/// # async fn run() -> inspection_realtime::Result<()> {
/// let manager = ConnectionManager::new("https://inspect.example.com/ws", Config::default())?;
///
/// let _handle = manager.subscribe("inspection_updated", |message| {
///     println!("updated: {:?}", message.data);
/// });
///
/// manager.connect("token".to_owned()).await?;
/// manager.send(OutboundMessage::new("subscribe_site"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    snapshot_rx: watch::Receiver<Snapshot>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    dispatcher: Arc<Dispatcher>,
    recovery: ErrorRecoveryManager,
    session_id: Arc<str>,
    url: Url,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.url.as_str())
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager for `endpoint` with its own recovery manager.
    ///
    /// `http(s)` endpoints are rewritten to `ws(s)`. Nothing is opened until
    /// [`connect`](Self::connect). Must be called within a Tokio runtime.
    ///
    /// Fails with a validation error when `config` does not pass
    /// [`Config::validate`].
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        Self::with_recovery(endpoint, config, ErrorRecoveryManager::default())
    }

    /// Create a manager whose connection attempts go through `recovery`.
    pub fn with_recovery(
        endpoint: &str,
        config: Config,
        recovery: ErrorRecoveryManager,
    ) -> Result<Self> {
        config.validate()?;
        let url = websocket_base(endpoint)?;
        let session_id: Arc<str> = Uuid::new_v4().to_string().into();
        let dispatcher = Arc::new(Dispatcher::new());

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let driver = Driver::new(
            config,
            url.clone(),
            Arc::clone(&session_id),
            Arc::clone(&dispatcher),
            recovery.clone(),
            Outlets {
                state_tx,
                snapshot_tx,
                events_tx: events_tx.clone(),
            },
        );
        tokio::spawn(driver.run(command_rx));

        #[cfg(feature = "tracing")]
        tracing::debug!(%url, %session_id, "Created connection manager");

        Ok(Self {
            command_tx,
            state_rx,
            snapshot_rx,
            events_tx,
            dispatcher,
            recovery,
            session_id,
            url,
        })
    }

    /// Open the session with `token`.
    ///
    /// Resolves once the transport is open and queued messages have been flushed.
    /// Already open or opening is a no-op. A failed explicit connect is reported
    /// and recorded but does not schedule automatic reconnects.
    ///
    /// The circuit breaker of the recovery manager is reset first, so an explicit
    /// connect always dials, also after automatic reconnects were exhausted. A write
    /// failure while flushing the queue is returned; the session has then already
    /// closed and follows the reconnect path.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self, token), fields(session_id = %self.session_id))
    )]
    pub async fn connect<T: Into<SecretString>>(&self, token: T) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            token: token.into(),
            reply,
        })?;

        rx.await.map_err(|_e| Error::from(WsError::Stopped))?
    }

    /// Close the session with the manual close code.
    ///
    /// Cancels the heartbeat and any scheduled reconnect and rejects every pending
    /// request. No reconnect follows.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect { reply })?;

        rx.await.map_err(|_e| Error::from(WsError::Stopped))
    }

    /// Send `message` now, or queue it until the next open.
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.command(Command::Send(message))
    }

    /// Send `message` with a fresh correlation id and wait for the frame that
    /// carries the same id.
    ///
    /// Fails at once when the session is not open, or with a validation error when
    /// `timeout` exceeds [`MAX_TIMER_DURATION`]. Otherwise exactly one of the
    /// response, the timeout or a manual disconnect settles the call.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self, message), fields(kind = %message.kind))
    )]
    pub async fn send_and_wait_for_response(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<InboundMessage> {
        if timeout > MAX_TIMER_DURATION {
            return Err(Error::validation(format!(
                "request timeout must not exceed {MAX_TIMER_DURATION:?}"
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.command(Command::Request {
            message,
            timeout,
            reply,
        })?;

        rx.await.map_err(|_e| Error::from(WsError::Stopped))?
    }

    /// Register `handler` for `topic`. See [`Dispatcher::subscribe`].
    pub fn subscribe<T, F>(&self, topic: T, handler: F) -> SubscriptionHandle
    where
        T: Into<Topic>,
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(topic, handler)
    }

    /// Stream of delivered messages matching `topic`.
    pub fn messages<T: Into<Topic>>(
        &self,
        topic: T,
    ) -> impl Stream<Item = Result<InboundMessage>> + use<T> {
        self.dispatcher.stream(topic.into())
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch receiver for state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let state = self.state();
        ConnectionStatus {
            connected: state.is_open(),
            connecting: state.is_connecting(),
        }
    }

    /// Diagnostic snapshot. The url never contains the token.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        let snapshot = self.snapshot_rx.borrow();
        ConnectionStats {
            is_connected: self.state().is_open(),
            reconnect_attempts: snapshot.reconnect_attempts,
            queued_messages: snapshot.queued,
            pending_messages: snapshot.pending,
            url: self.url.to_string(),
        }
    }

    /// Most recent transport failure.
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.snapshot_rx.borrow().last_error.clone()
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    fn command(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_e| WsError::Stopped.into())
    }
}
