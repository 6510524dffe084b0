#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::error::Kind;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The server did not complete the handshake in time
    ConnectTimeout(Duration),
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// The session was closed manually while the request was outstanding
    Disconnected,
    /// A correlated request was issued while no transport is open
    NotConnected,
    /// No correlated response arrived within the deadline
    ResponseTimeout {
        /// Correlation id of the request
        id: String,
        /// Deadline that elapsed
        after: Duration,
    },
    /// Message stream lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
    /// The connection manager has shut down
    Stopped,
}

impl WsError {
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Connection(_) | Self::ConnectTimeout(_) => Kind::Connection,
            Self::MessageParse(_) | Self::Lagged { .. } => Kind::Protocol,
            Self::Disconnected | Self::Stopped => Kind::Disconnected,
            Self::NotConnected => Kind::Validation,
            Self::ResponseTimeout { .. } => Kind::Timeout,
        }
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectTimeout(after) => {
                write!(f, "WebSocket handshake did not complete within {after:?}")
            }
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::Disconnected => write!(f, "WebSocket session was disconnected"),
            Self::NotConnected => write!(
                f,
                "WebSocket is not open; correlated requests cannot be queued"
            ),
            Self::ResponseTimeout { id, after } => {
                write!(f, "No response to request {id} within {after:?}")
            }
            Self::Lagged { count } => write!(f, "Subscription lagged, missed {count} messages"),
            Self::Stopped => write!(f, "WebSocket connection manager has shut down"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(e.kind(), e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsError::Connection(e).into()
    }
}
