//! Background task that owns one session.
//!
//! The driver is the only owner of the socket, the outbound queue, the pending
//! request table and every timer. Handles talk to it over a command channel, so
//! all session state is mutated from a single logical flow.

use std::collections::{HashMap, VecDeque};
use std::future::{pending, poll_fn};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use secrecy::SecretString;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::time::{DelayQueue, delay_queue};
use url::Url;
use uuid::Uuid;

use super::config::Config;
use super::connection::ConnectionState;
use super::dispatcher::{Dispatcher, Route};
use super::endpoint::session_url;
use super::error::WsError;
use super::types::{ConnectionEvent, InboundMessage, OutboundMessage, parse_frame};
use crate::Result;
use crate::error::{Error, ErrorRecord};
use crate::recovery::{CircuitOpen, ErrorRecoveryManager, RecoveryOptions};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code of a manual disconnect. Only closes with any other code reconnect.
pub const MANUAL_CLOSE_CODE: u16 = 1000;
const NO_STATUS_CLOSE_CODE: u16 = 1005;
const ABNORMAL_CLOSE_CODE: u16 = 1006;
/// Close code used when the server stops answering pings.
pub const HEARTBEAT_TIMEOUT_CLOSE_CODE: u16 = 4000;

const MANUAL_CLOSE_REASON: &str = "manual disconnect";
/// Upper bound on waiting for our close frame to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub(crate) enum Command {
    Connect {
        token: SecretString,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send(OutboundMessage),
    Request {
        message: OutboundMessage,
        timeout: Duration,
        reply: oneshot::Sender<Result<InboundMessage>>,
    },
}

/// Counters published to handles after every driver step.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) reconnect_attempts: u32,
    pub(crate) queued: usize,
    pub(crate) pending: usize,
    pub(crate) last_error: Option<ErrorRecord>,
}

/// Channels through which the driver reports to its handles.
pub(crate) struct Outlets {
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) snapshot_tx: watch::Sender<Snapshot>,
    pub(crate) events_tx: broadcast::Sender<ConnectionEvent>,
}

struct Transport {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

struct PendingRequest {
    reply: oneshot::Sender<Result<InboundMessage>>,
    deadline: delay_queue::Key,
    timeout: Duration,
}

enum Transmit {
    Sent,
    /// The message could not be encoded and was discarded
    Dropped,
    /// No transport, or the write failed and the transport was torn down
    Failed(Error),
}

pub(crate) struct Driver {
    config: Config,
    base_url: Url,
    session_id: Arc<str>,
    token: Option<SecretString>,
    transport: Option<Transport>,
    state: ConnectionState,
    reconnect_attempts: u32,
    reconnect_backoff: ExponentialBackoff,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    missed_heartbeats: u32,
    queue: VecDeque<OutboundMessage>,
    pending: HashMap<String, PendingRequest>,
    deadlines: DelayQueue<String>,
    last_error: Option<ErrorRecord>,
    dispatcher: Arc<Dispatcher>,
    recovery: ErrorRecoveryManager,
    outlets: Outlets,
}

impl Driver {
    pub(crate) fn new(
        config: Config,
        base_url: Url,
        session_id: Arc<str>,
        dispatcher: Arc<Dispatcher>,
        recovery: ErrorRecoveryManager,
        outlets: Outlets,
    ) -> Self {
        let reconnect_backoff = config.reconnect.clone().into();

        Self {
            config,
            base_url,
            session_id,
            token: None,
            transport: None,
            state: ConnectionState::Idle,
            reconnect_attempts: 0,
            reconnect_backoff,
            reconnect_timer: None,
            heartbeat: None,
            missed_heartbeats: 0,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            deadlines: DelayQueue::new(),
            last_error: None,
            dispatcher,
            recovery,
            outlets,
        }
    }

    /// Run until every handle is dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }

                frame = next_frame(&mut self.transport) => {
                    self.handle_frame(frame).await;
                }

                () = tick(&mut self.heartbeat) => {
                    self.heartbeat_tick().await;
                }

                () = elapsed(&mut self.reconnect_timer) => {
                    self.reconnect().await;
                }

                Some(expired) = poll_fn(|cx| self.deadlines.poll_expired(cx)), if !self.deadlines.is_empty() => {
                    self.expire(expired.into_inner());
                }
            }

            self.publish();
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { token, reply } => {
                let result = self.connect(token).await;
                self.publish();
                _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                self.publish();
                _ = reply.send(());
            }
            Command::Send(message) => self.send(message).await,
            Command::Request {
                message,
                timeout,
                reply,
            } => self.request(message, timeout, reply).await,
        }
    }

    async fn connect(&mut self, token: SecretString) -> Result<()> {
        if self.state.is_open() || self.state.is_connecting() {
            return Ok(());
        }

        // An explicit connect takes over from any scheduled reconnect and is not
        // held back by failures of earlier automatic attempts.
        self.reconnect_timer = None;
        self.recovery.reset_circuit_breaker();
        self.token = Some(token);

        let stream = self.dial().await?;
        self.establish(stream).await
    }

    /// Run the opening handshake with the stored token, guarded by the breaker.
    async fn dial(&mut self) -> Result<WsStream> {
        let Some(token) = &self.token else {
            return Err(Error::validation("no token supplied for the session"));
        };
        let url = session_url(&self.base_url, token, &self.session_id).to_string();
        let connect_timeout = self.config.connect_timeout;

        self.set_state(ConnectionState::Connecting);

        let opened = self
            .recovery
            .execute(
                "ws.connect",
                RecoveryOptions::circuit_breaker_only(),
                || {
                    let url = url.clone();
                    async move {
                        match timeout(connect_timeout, connect_async(url)).await {
                            Ok(Ok((stream, _response))) => Ok(stream),
                            Ok(Err(e)) => Err(WsError::Connection(e).into()),
                            Err(_elapsed) => Err(WsError::ConnectTimeout(connect_timeout).into()),
                        }
                    }
                },
            )
            .await;

        match opened {
            Ok(stream) => Ok(stream),
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(url = %self.base_url, error = %error, "Unable to connect");

                let record = error.record("ws.connect");
                self.last_error = Some(record.clone());
                self.set_state(ConnectionState::Closed);
                self.emit(ConnectionEvent::ConnectionError(record));
                Err(error)
            }
        }
    }

    /// Take over a freshly opened socket and flush the queue through it.
    ///
    /// A write failure during the flush closes the session again through the
    /// abnormal-close path and is returned, so `Connected` is only emitted for a
    /// session that is still open.
    async fn establish(&mut self, stream: WsStream) -> Result<()> {
        let (sink, stream) = stream.split();
        self.transport = Some(Transport { sink, stream });
        self.reconnect_attempts = 0;
        self.reconnect_backoff.reset();
        self.set_state(ConnectionState::Open {
            since: std::time::Instant::now(),
        });
        self.start_heartbeat();

        #[cfg(feature = "tracing")]
        tracing::info!(
            session_id = %self.session_id,
            url = %self.base_url,
            "WebSocket session opened"
        );

        self.flush_queue().await?;
        self.emit(ConnectionEvent::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.cancel_timers();
        self.reject_pending(|| WsError::Disconnected);
        self.token = None;

        if let Some(transport) = self.transport.take() {
            self.set_state(ConnectionState::Closing);
            close_transport(transport, MANUAL_CLOSE_CODE, MANUAL_CLOSE_REASON).await;
            self.set_state(ConnectionState::Closed);

            #[cfg(feature = "tracing")]
            tracing::info!(session_id = %self.session_id, "WebSocket session closed manually");

            self.emit(ConnectionEvent::Disconnected {
                code: MANUAL_CLOSE_CODE,
                reason: MANUAL_CLOSE_REASON.to_owned(),
                manual: true,
            });
        } else if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Closed);
        }
    }

    async fn send(&mut self, message: OutboundMessage) {
        if !self.state.is_open() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                kind = %message.kind,
                queued = self.queue.len() + 1,
                "Not connected, queueing message"
            );
            self.queue.push_back(message);
            return;
        }

        if let Transmit::Failed(_) = self.transmit(&message).await {
            self.queue.push_back(message);
        }
    }

    async fn request(
        &mut self,
        mut message: OutboundMessage,
        timeout: Duration,
        reply: oneshot::Sender<Result<InboundMessage>>,
    ) {
        if !self.state.is_open() {
            _ = reply.send(Err(WsError::NotConnected.into()));
            return;
        }

        let id = Uuid::now_v7().to_string();
        message.id = Some(id.clone());
        let deadline = self.deadlines.insert(id.clone(), timeout);
        self.pending.insert(
            id.clone(),
            PendingRequest {
                reply,
                deadline,
                timeout,
            },
        );

        let failure = match self.transmit(&message).await {
            Transmit::Sent => return,
            Transmit::Dropped => Error::validation("request could not be encoded"),
            Transmit::Failed(error) => error,
        };
        if let Some(request) = self.take_pending(&id) {
            _ = request.reply.send(Err(failure));
        }
    }

    /// Send queued messages in order. The unsent remainder stays queued on failure.
    async fn flush_queue(&mut self) -> Result<()> {
        #[cfg(feature = "tracing")]
        if !self.queue.is_empty() {
            tracing::debug!(count = self.queue.len(), "Flushing queued messages");
        }

        while let Some(message) = self.queue.pop_front() {
            if let Transmit::Failed(error) = self.transmit(&message).await {
                self.queue.push_front(message);
                return Err(error);
            }
        }
        Ok(())
    }

    async fn transmit(&mut self, message: &OutboundMessage) -> Transmit {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(kind = %message.kind, error = %e, "Dropping unencodable message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return Transmit::Dropped;
            }
        };

        let Some(transport) = self.transport.as_mut() else {
            return Transmit::Failed(WsError::Disconnected.into());
        };

        match transport.sink.send(Message::Text(json.into())).await {
            Ok(()) => Transmit::Sent,
            Err(e) => {
                let error = Error::from(e);
                self.last_error = Some(error.record("ws.write"));
                self.on_closed(ABNORMAL_CLOSE_CODE, error.to_string());
                Transmit::Failed(error)
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_payload(text.as_bytes()).await,
            Some(Ok(Message::Binary(bytes))) => self.handle_payload(&bytes).await,
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame.map_or_else(
                    || (NO_STATUS_CLOSE_CODE, String::new()),
                    |frame| (u16::from(frame.code), frame.reason.to_string()),
                );
                self.on_closed(code, reason);
            }
            Some(Ok(_)) => {
                // Transport-level ping/pong is answered by tungstenite itself.
            }
            Some(Err(e)) => {
                let error = Error::from(e);
                self.last_error = Some(error.record("ws.read"));
                self.on_closed(ABNORMAL_CLOSE_CODE, error.to_string());
            }
            None => self.on_closed(ABNORMAL_CLOSE_CODE, "stream ended".to_owned()),
        }
    }

    async fn handle_payload(&mut self, bytes: &[u8]) {
        let message = match parse_frame(bytes) {
            Ok(message) => message,
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %error, "Failed to parse WebSocket message");

                self.emit(ConnectionEvent::ProtocolError(error.record("ws.parse")));
                return;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(?message, "Received WebSocket message");

        match Dispatcher::route(&message) {
            Route::ReplyPong => {
                self.transmit(&OutboundMessage::pong()).await;
            }
            Route::Heartbeat => {
                self.missed_heartbeats = 0;
                self.emit(ConnectionEvent::Heartbeat { at: Utc::now() });
            }
            Route::Deliver => {
                let correlated = message
                    .id
                    .as_deref()
                    .and_then(|id| self.take_pending(id));

                match correlated {
                    Some(request) => {
                        _ = request.reply.send(Ok(message));
                    }
                    None => {
                        self.dispatcher.deliver(message);
                    }
                }
            }
        }
    }

    async fn heartbeat_tick(&mut self) {
        if !self.state.is_open() {
            self.heartbeat = None;
            return;
        }

        let max_missed = self.config.max_missed_heartbeats;
        if max_missed > 0 && self.missed_heartbeats >= max_missed {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                missed = self.missed_heartbeats,
                "Heartbeat timeout: no pong received, closing connection"
            );

            if let Some(transport) = self.transport.take() {
                close_transport(transport, HEARTBEAT_TIMEOUT_CLOSE_CODE, "heartbeat timeout")
                    .await;
            }
            self.on_closed(HEARTBEAT_TIMEOUT_CLOSE_CODE, "heartbeat timeout".to_owned());
            return;
        }

        self.missed_heartbeats += 1;
        self.transmit(&OutboundMessage::ping()).await;
    }

    fn start_heartbeat(&mut self) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.heartbeat = Some(heartbeat);
        self.missed_heartbeats = 0;
    }

    fn cancel_timers(&mut self) {
        self.heartbeat = None;
        self.reconnect_timer = None;
        self.missed_heartbeats = 0;
    }

    /// The transport is gone. Timers are cancelled before reconnect logic runs.
    fn on_closed(&mut self, code: u16, reason: String) {
        self.cancel_timers();
        self.transport = None;
        self.set_state(ConnectionState::Closed);

        let manual = code == MANUAL_CLOSE_CODE;

        #[cfg(feature = "tracing")]
        tracing::info!(code, reason = %reason, manual, "WebSocket connection closed");

        self.emit(ConnectionEvent::Disconnected {
            code,
            reason,
            manual,
        });

        if !manual {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.token.is_none() {
            return;
        }

        if self.reconnect_attempts >= self.config.reconnect.max_attempts {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                attempts = self.reconnect_attempts,
                "Reconnect attempts exhausted, waiting for an explicit connect"
            );

            self.emit(ConnectionEvent::ReconnectExhausted {
                attempts: self.reconnect_attempts,
            });
            return;
        }

        self.reconnect_attempts += 1;
        let delay = self
            .reconnect_backoff
            .next_backoff()
            .unwrap_or(self.config.reconnect.max_backoff);

        #[cfg(feature = "tracing")]
        tracing::info!(
            attempt = self.reconnect_attempts,
            max_attempts = self.config.reconnect.max_attempts,
            ?delay,
            "Scheduling reconnect"
        );

        self.reconnect_timer = Some(Box::pin(sleep(delay)));
        self.emit(ConnectionEvent::ReconnectScheduled {
            attempt: self.reconnect_attempts,
            delay,
        });
    }

    async fn reconnect(&mut self) {
        self.reconnect_timer = None;

        match self.dial().await {
            Ok(stream) => {
                // A failed flush has already taken the abnormal-close path.
                _ = self.establish(stream).await;
            }
            Err(error) => match error.downcast_ref::<CircuitOpen>() {
                Some(rejection) => self.defer_reconnect(rejection.retry_after),
                None => self.schedule_reconnect(),
            },
        }
    }

    /// Retry the current attempt once the breaker admits a trial. A rejected
    /// attempt never dialled, so it does not use up the reconnect budget.
    fn defer_reconnect(&mut self, retry_after: Duration) {
        let delay = retry_after.max(self.config.reconnect.initial_backoff);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            attempt = self.reconnect_attempts,
            ?delay,
            "Circuit breaker is open, deferring reconnect"
        );

        self.reconnect_timer = Some(Box::pin(sleep(delay)));
        self.emit(ConnectionEvent::ReconnectScheduled {
            attempt: self.reconnect_attempts,
            delay,
        });
    }

    fn take_pending(&mut self, id: &str) -> Option<PendingRequest> {
        let request = self.pending.remove(id)?;
        self.deadlines.remove(&request.deadline);
        Some(request)
    }

    fn expire(&mut self, id: String) {
        if let Some(request) = self.pending.remove(&id) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%id, timeout = ?request.timeout, "Request timed out");

            let after = request.timeout;
            _ = request
                .reply
                .send(Err(WsError::ResponseTimeout { id, after }.into()));
        }
    }

    fn reject_pending<F>(&mut self, error: F)
    where
        F: Fn() -> WsError,
    {
        self.deadlines.clear();

        #[cfg(feature = "tracing")]
        if !self.pending.is_empty() {
            tracing::debug!(count = self.pending.len(), "Rejecting pending requests");
        }

        for (_, request) in self.pending.drain() {
            _ = request.reply.send(Err(error().into()));
        }
    }

    async fn shutdown(mut self) {
        self.cancel_timers();
        self.reject_pending(|| WsError::Stopped);

        if let Some(transport) = self.transport.take() {
            close_transport(transport, MANUAL_CLOSE_CODE, MANUAL_CLOSE_REASON).await;
        }
        self.set_state(ConnectionState::Closed);
        self.publish();

        #[cfg(feature = "tracing")]
        tracing::debug!(session_id = %self.session_id, "Connection manager stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        tracing::trace!(from = %self.state, to = %state, "Connection state changed");

        self.state = state;
        self.outlets.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // Having no listeners is fine
        _ = self.outlets.events_tx.send(event);
    }

    fn publish(&self) {
        let snapshot = Snapshot {
            reconnect_attempts: self.reconnect_attempts,
            queued: self.queue.len(),
            pending: self.pending.len(),
            last_error: self.last_error.clone(),
        };

        self.outlets.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn next_frame(
    transport: &mut Option<Transport>,
) -> Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match transport {
        Some(transport) => transport.stream.next().await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

/// Best-effort close handshake; the transport is dropped afterwards either way.
async fn close_transport(mut transport: Transport, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };

    if let Err(e) = timeout(CLOSE_GRACE, transport.sink.send(Message::Close(Some(frame)))).await
    {
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %e, "Close frame was not written in time");
        #[cfg(not(feature = "tracing"))]
        let _ = &e;
    }
}
