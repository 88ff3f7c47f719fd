//! Error types for the request-execution engine.
//!
//! # Design
//! Failures are never raised past the execution boundary. Every outcome,
//! including a failure, is a `Response`; a failed one carries a
//! `ClientError` in its `exception` slot. `ClientError::class` reduces any
//! failure to an `ErrorClass` so host-level health counters can be updated
//! without inspecting message text.
//!
//! `TransportError` is the distinguished error value produced by transports.
//! It is plain data (`Clone`, no boxed source) so it can travel through
//! oneshot channels and be parked on a connection until the next receive.

use std::io;

/// Error value produced by a transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Socket-level I/O failure, keeping the originating error kind.
    #[error("io error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// The peer closed the connection before a full response arrived.
    #[error("connection closed")]
    Closed,

    /// The peer sent bytes that are not a valid HTTP/1.1 response.
    #[error("malformed response: {0}")]
    Parse(String),

    /// A new connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Classified failure attached to a `Response`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The transport failed while sending or receiving.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No response arrived before the request's timeout elapsed.
    #[error("request timeout")]
    Timeout,

    /// The server answered with a status other than 200.
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    /// The formatter could not decode the response body.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The request body could not be rendered.
    #[error("serialization failed: {0}")]
    Serialize(String),

    /// The status code in the response was not an integer.
    #[error("invalid status code {0:?}")]
    InvalidStatus(String),

    /// The execution task ended without delivering a response.
    #[error("response channel dropped")]
    Dropped,
}

/// Coarse failure category recorded on host health counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Socket-level failure with its I/O error kind.
    Network(io::ErrorKind),
    /// The connection was closed or never opened.
    Closed,
    /// Malformed bytes on the wire.
    Protocol,
    Timeout,
    /// Non-200 status returned by the server.
    Status(u16),
    Decode,
    /// Fault raised locally before or after the exchange.
    Local,
}

impl ClientError {
    /// Category used for host health accounting.
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Transport(TransportError::Io { kind, .. }) => ErrorClass::Network(*kind),
            ClientError::Transport(TransportError::Closed)
            | ClientError::Transport(TransportError::Connect(_)) => ErrorClass::Closed,
            ClientError::Transport(TransportError::Parse(_)) => ErrorClass::Protocol,
            ClientError::Timeout => ErrorClass::Timeout,
            ClientError::Status { code, .. } => ErrorClass::Status(*code),
            ClientError::Decode(_) => ErrorClass::Decode,
            ClientError::Serialize(_) | ClientError::InvalidStatus(_) | ClientError::Dropped => {
                ErrorClass::Local
            }
        }
    }

    /// Numeric code carried by the failure, if any.
    pub fn code(&self) -> Option<u16> {
        match self {
            ClientError::Timeout => Some(408),
            ClientError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout)
    }
}
