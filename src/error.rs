//! Error types for the client layer.
//!
//! The taxonomy mirrors what the underlying driver reports: fatal
//! connection-level failures, recoverable server-side query errors, and the
//! layer's own deadline and usage errors.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for client-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error class, used by the pool to decide whether a connection can
/// be reused after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection is unusable until a reset succeeds.
    ConnectionBad,
    /// The server rejected the command; the connection is still usable.
    Query,
    /// A connect or command deadline elapsed.
    Timeout,
    /// The driver produced a malformed or unexpected response.
    Protocol,
    /// A previous command expired and the connection awaits a reset.
    Expired,
    /// A command was issued while another was still outstanding.
    Busy,
}

/// Errors surfaced by connections and pools.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Socket or handshake failure. Fatal until a reconnect succeeds.
    #[error("connection bad: {0}")]
    ConnectionBad(String),

    /// Server-reported command error.
    #[error("{severity}: {message} ({code})")]
    Query {
        severity: String,
        code: String,
        message: String,
    },

    /// A connect or command deadline elapsed. The connection is marked
    /// aborted and must be reset before reuse.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed response from the driver. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A previous command expired; the connection requires an explicit
    /// reset before it accepts new commands.
    #[error("previous command expired, connection reset required")]
    Expired,

    /// Caller error: one command at a time per connection.
    #[error("another command is already outstanding on this connection")]
    Busy,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConnectionBad(_) => ErrorKind::ConnectionBad,
            Error::Query { .. } => ErrorKind::Query,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Expired => ErrorKind::Expired,
            Error::Busy => ErrorKind::Busy,
        }
    }

    /// True for errors that mean the connection itself is no longer usable
    /// and a reconnect may help.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionBad | ErrorKind::Protocol
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::ConnectionBad(e.to_string())
    }
}
