//! Wire frames and the typed values exposed to subscribers.
//!
//! Every frame is a JSON object `{type, data?, timestamp, id?}`. The `type` values
//! `ping`, `pong`, `connection_established` and `notification` are reserved; any
//! other string is application-defined and surfaces as [`MessageKind::Custom`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::WsError;
use crate::Result;
use crate::error::ErrorRecord;

/// Message `type` of a frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Ping,
    Pong,
    ConnectionEstablished,
    Notification,
    /// Application-defined type
    Custom(String),
}

impl MessageKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::ConnectionEstablished => "connection_established",
            Self::Notification => "notification",
            Self::Custom(kind) => kind,
        }
    }
}

impl From<&str> for MessageKind {
    fn from(kind: &str) -> Self {
        match kind {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "connection_established" => Self::ConnectionEstablished,
            "notification" => Self::Notification,
            other => Self::Custom(other.to_owned()),
        }
    }
}

impl From<String> for MessageKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "ping" | "pong" | "connection_established" | "notification" => {
                Self::from(kind.as_str())
            }
            _ => Self::Custom(kind),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Custom(kind) => kind,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of the subscription table.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Messages of exactly this kind
    Kind(MessageKind),
    /// Every forwarded message, after the kind-specific handlers
    All,
}

impl Topic {
    #[must_use]
    pub fn matches(&self, kind: &MessageKind) -> bool {
        match self {
            Self::Kind(topic) => topic == kind,
            Self::All => true,
        }
    }
}

impl From<MessageKind> for Topic {
    fn from(kind: MessageKind) -> Self {
        Self::Kind(kind)
    }
}

impl From<&str> for Topic {
    fn from(kind: &str) -> Self {
        Self::Kind(kind.into())
    }
}

/// Frame sent to the server.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    /// Correlation id, assigned by `send_and_wait_for_response`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new<K: Into<MessageKind>>(kind: K) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            timestamp: Utc::now(),
            id: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping)
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::new(MessageKind::Pong)
    }
}

/// Frame received from the server.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Parse one text frame.
pub fn parse_frame(bytes: &[u8]) -> Result<InboundMessage> {
    serde_json::from_slice(bytes).map_err(|e| WsError::MessageParse(e).into())
}

/// Lifecycle notifications for ambient listeners.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The transport opened and the outbound queue was flushed
    Connected,
    /// The transport closed. `manual` is true for the sentinel close code.
    Disconnected {
        code: u16,
        reason: String,
        manual: bool,
    },
    /// Opening the transport failed
    ConnectionError(ErrorRecord),
    /// A frame could not be parsed and was dropped
    ProtocolError(ErrorRecord),
    /// The server answered a ping
    Heartbeat { at: DateTime<Utc> },
    /// An automatic reconnect will run after `delay`
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The reconnect budget is spent; only an explicit `connect` reopens the session
    ReconnectExhausted { attempts: u32 },
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connecting: bool,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub queued_messages: usize,
    pub pending_messages: usize,
    /// Base session url, without the token
    pub url: String,
}
