//! Protocol and transport error types.

use thiserror::Error;

use crate::codec::DecodeError;
use crate::transport::SocketRole;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Result type for socket operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A malformed or oversized frame. Fatal to the connection it arrived on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame part exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Payload bytes did not decode.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed in the middle of a frame.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// A frame with zero parts.
    #[error("empty message")]
    EmptyMessage,

    /// Too many parts for one frame.
    #[error("too many frame parts: {0} (max: 255)")]
    TooManyParts(usize),

    /// The frame had the wrong number of parts for its purpose.
    #[error("expected {expected} frame parts, got {received}")]
    PartCount { expected: usize, received: usize },

    /// The peer greeted with a role this socket does not talk to.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// A frame that decoded but does not have the expected shape.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    pub fn serialization(reason: impl std::fmt::Display) -> Self {
        Self::Serialization(reason.to_string())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidMessage(reason.into())
    }
}

/// Errors surfaced by socket roles.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No frame arrived within the read timeout. Retryable.
    #[error("timed out waiting for {operation}")]
    Timeout { operation: &'static str },

    /// Malformed traffic on a connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The operation does not apply to this socket role.
    #[error("{operation} is not supported on a {role} socket")]
    WrongSocketRole {
        role: SocketRole,
        operation: &'static str,
    },

    /// The peer or the socket's background tasks went away.
    #[error("connection closed")]
    Closed,

    /// The destination client is not connected (router only).
    #[error("unknown client {0}")]
    UnknownClient(String),

    /// Another live process is bound to the socket path.
    #[error("socket already in use: {path}")]
    SocketInUse { path: String },

    /// The socket's parent directory does not exist.
    #[error("invalid socket path: {path}")]
    SocketPathInvalid { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the caller can simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn wrong_role(role: SocketRole, operation: &'static str) -> Self {
        Self::WrongSocketRole { role, operation }
    }
}
