//! Client error types.

use std::time::Duration;

use steward_protocol::TransportError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bad command-line arguments.
    #[error("invalid argument: {0}")]
    Usage(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connecting to or talking with the server failed.
    #[error("connection error: {0}")]
    Transport(#[from] TransportError),

    /// A response did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error.
    #[error("{0}")]
    Command(String),

    /// No terminal response arrived in time.
    #[error("timeout: no response to '{command}' after {}s", timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },

    /// The connection closed with the request still open.
    #[error("connection closed while waiting for '{0}'")]
    Closed(String),

    /// The daemon failed to start or stopped with an error.
    #[error("server error: {0}")]
    Server(#[from] steward_server::ServerError),
}

impl ClientError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_pass_through() {
        let err = ClientError::Command("unknown command 'nope'".into());
        assert_eq!(err.to_string(), "unknown command 'nope'");
    }

    #[test]
    fn timeout_names_the_command() {
        let err = ClientError::Timeout {
            command: "deploy".into(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "timeout: no response to 'deploy' after 1.5s");
    }
}
