//! Error types for twinlink
//!
//! [`TwinError`] is returned synchronously by every fallible call across the
//! twinlink crates. [`OperationError`] is the failure an asynchronous remote
//! operation completes with; it is `Clone` so the same failure can reach both
//! a failure continuation and an awaiting caller.

use std::path::PathBuf;

/// Main error type for twinlink operations
#[derive(Debug, thiserror::Error)]
pub enum TwinError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection timeout after {seconds}s")]
    ConnectionTimeout { seconds: u64 },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Client closed")]
    ClientClosed,

    // === Registry Errors ===

    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    // === Protocol Errors ===

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Operation Errors ===

    #[error(transparent)]
    Operation(#[from] OperationError),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TwinError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionTimeout { .. } | Self::Connection(_) | Self::NotConnected => true,
            Self::Operation(op) => op.is_retryable(),
            _ => false,
        }
    }
}

/// Failure of a submitted remote operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The remote side answered with a failure
    #[error("Remote operation failed ({code}): {message}")]
    Remote { code: String, message: String },

    /// No reply arrived before the deadline
    #[error("Operation {correlation_id} timed out after {after_ms}ms")]
    Timeout { correlation_id: u64, after_ms: u64 },

    /// The transport dropped while the operation was outstanding
    #[error("Connection lost while operation was outstanding")]
    ConnectionLost,

    /// The client was destroyed before a reply arrived
    #[error("Client shutting down")]
    ShuttingDown,

    /// The pending entry was dropped without ever being completed
    #[error("Operation abandoned")]
    Abandoned,
}

impl OperationError {
    /// Create a remote error
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Check if resubmitting the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionLost)
    }
}

/// Result type alias using TwinError
pub type Result<T> = std::result::Result<T, TwinError>;
