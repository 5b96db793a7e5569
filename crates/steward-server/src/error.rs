//! Server error types.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// What a capability body returns.
pub type CapabilityResult = Result<serde_json::Value, DispatchError>;

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Transport error (bind, handshake, framing).
    #[error("Transport error: {0}")]
    Transport(#[from] steward_protocol::TransportError),

    /// Capability registration failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Server is already running.
    #[error("Server is already running (PID file exists: {path})")]
    AlreadyRunning { path: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A start hook failed.
    #[error("Start hook '{name}' failed: {source}")]
    StartHook {
        name: String,
        #[source]
        source: DispatchError,
    },
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an already running error.
    pub fn already_running(path: impl Into<String>) -> Self {
        Self::AlreadyRunning { path: path.into() }
    }
}

/// Rejected capability or extension registrations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("'{0}' is already registered")]
    Duplicate(String),

    #[error("'{name}' conflicts with existing {existing} '{prefix}'")]
    Conflict {
        name: String,
        prefix: String,
        existing: &'static str,
    },

    #[error("invalid capability name '{0}'")]
    InvalidName(String),

    #[error("extension '{0}' is already loaded")]
    DuplicateExtension(String),

    #[error("invalid event pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Failure of one command, event handler or task body.
///
/// Every variant becomes a terminal `error` response; [`describe`] decides
/// how much of it the client sees.
///
/// [`describe`]: DispatchError::describe
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The command path does not resolve to a callable.
    #[error("unknown command '{0}'")]
    NotFound(String),

    /// The command exists but the caller may not run it.
    #[error("command '{0}' is not allowed")]
    Forbidden(String),

    /// The capability rejected its arguments.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The capability failed with a message meant for the caller.
    #[error("{0}")]
    Execution(String),

    /// The capability failed with an error whose detail stays in the log.
    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn StdError + Send + Sync>),

    /// The body panicked.
    #[error("panicked: {0}")]
    Panic(String),
}

impl DispatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn internal(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::Internal(Box::new(error))
    }

    /// Builds a [`Panic`](Self::Panic) from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panic(message)
    }

    /// The text sent to the client for a failure of `command`.
    pub fn describe(&self, command: &str) -> String {
        match self {
            Self::NotFound(_) | Self::Forbidden(_) | Self::InvalidArguments(_) => self.to_string(),
            Self::Execution(message) => format!("{command} failed: {message}"),
            Self::Internal(_) | Self::Panic(_) => {
                format!("{command} failed with an internal error")
            }
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArguments(e.to_string())
    }
}
