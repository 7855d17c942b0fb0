//! Client error types

use remote_analyze_orchestration::{OrchestratorError, WireErrorKind};
use thiserror::Error;

/// Client operation errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Analysis not completed: {0}")]
    NotCompleted(String),

    #[error("Server error ({kind}): {message}")]
    Server { kind: WireErrorKind, message: String },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Dependency collector failed for `{command}`: {message}")]
    CollectorFailure { command: String, message: String },

    #[error("Compilation database error: {0}")]
    CompileDatabase(String),

    #[error("Bundle error: {0}")]
    Bundle(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Create a new connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionError(message.into())
    }

    /// Create a new protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a new collector error
    pub fn collector(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CollectorFailure {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::TimeoutError(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Map an error response from the server
    pub fn from_wire(kind: WireErrorKind, message: String) -> Self {
        match kind {
            WireErrorKind::NotFound => Self::NotFound(message),
            WireErrorKind::NotCompleted => Self::NotCompleted(message),
            _ => Self::Server { kind, message },
        }
    }
}

impl From<OrchestratorError> for ClientError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Io(e) => ClientError::Io(e),
            OrchestratorError::Protocol(message) | OrchestratorError::Serialization(message) => {
                ClientError::ProtocolError(message)
            }
            other => ClientError::Bundle(other.to_string()),
        }
    }
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;
