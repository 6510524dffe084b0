use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// The transport failed to open or broke while open
    Connection,
    /// A frame could not be parsed or violated the wire format
    Protocol,
    /// No answer arrived within the deadline
    Timeout,
    /// The circuit breaker rejected the call without running it
    CircuitOpen,
    /// Transport-level failure reported by a guarded operation
    Network,
    /// Remote side answered with a server-class failure
    Server,
    /// The session was closed while the operation was in flight
    Disconnected,
    /// Invalid input or an operation issued in the wrong state
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            source: None,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    /// A transport-level failure from a guarded operation, e.g. a refused HTTP connection.
    pub fn network<S: Into<String>>(message: S) -> Self {
        Network {
            reason: message.into(),
        }
        .into()
    }

    /// A server-class failure, e.g. an HTTP 5xx answer.
    pub fn server<S: Into<String>>(status_code: u16, message: S) -> Self {
        Status {
            status_code,
            message: message.into(),
        }
        .into()
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Error::with_source(
            Kind::Timeout,
            Network {
                reason: message.into(),
            },
        )
    }

    /// Serializable snapshot of this error for events and history.
    #[must_use]
    pub fn record(&self, context: &str) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind,
            message: self.to_string(),
            context: context.to_owned(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Flat, serializable description of a failure.
///
/// Events and the recovery history carry this instead of [`Error`] so listeners
/// can clone, log or ship it without holding on to the error chain.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: Kind,
    pub message: String,
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Status {
    pub status_code: u16,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error({}): {}", self.status_code, self.message)
    }
}

impl StdError for Status {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Network {
    pub reason: String,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl StdError for Network {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Protocol, e)
    }
}

#[cfg(feature = "ws")]
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::with_source(Kind::Server, err)
    }
}

impl From<Network> for Error {
    fn from(err: Network) -> Self {
        Error::with_source(Kind::Network, err)
    }
}
