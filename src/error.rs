use std::error;
use std::fmt;

use http_types::StatusCode;

/// Errors attached to a transaction when an exchange does not complete cleanly.
///
/// None of these are returned across the connection boundary. The connection
/// records them on the transaction and decides whether to keep the stream
/// open, upgrade it or close it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The client gave up waiting for the response.
    Timeout,
    /// The stream closed before the message was complete.
    PrematureClose,
    /// The peer answered with an HTTP error status.
    Status(StatusCode),
    /// The message could not be parsed.
    Malformed(String),
    /// The server refused a WebSocket handshake.
    HandshakeRejected,
    /// Any other failure recorded by the application.
    Other {
        /// Human readable description.
        message: String,
        /// Status code associated with the failure, if any.
        status: Option<StatusCode>,
    },
}

impl Error {
    /// Create an error from a message and an optional status code.
    pub fn new(message: impl Into<String>, status: Option<StatusCode>) -> Self {
        Error::Other {
            message: message.into(),
            status,
        }
    }

    /// The status code associated with this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status(status) => Some(*status),
            Error::Malformed(_) => Some(StatusCode::BadRequest),
            Error::Other { status, .. } => *status,
            Error::Timeout | Error::PrematureClose | Error::HandshakeRejected => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => f.write_str("Request timeout"),
            Error::PrematureClose => f.write_str("premature connection close"),
            Error::Status(status) => write!(f, "{} {}", status, status.canonical_reason()),
            Error::Malformed(reason) => write!(f, "malformed message: {}", reason),
            Error::HandshakeRejected => f.write_str("websocket handshake rejected"),
            Error::Other { message, .. } => f.write_str(message),
        }
    }
}

impl error::Error for Error {}
