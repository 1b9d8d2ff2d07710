//! Error taxonomy for the offline layer.
//!
//! Store errors never escape into sync control flow; the orchestrator logs
//! them and degrades. API errors are always treated as recoverable network
//! failures by the callers.

use thiserror::Error;

/// Failures raised by the local SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was never opened, failed to open, or has been closed.
    #[error("local store is not ready")]
    NotReady,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transaction {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

/// Failures talking to the admin dashboard.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Network(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("invalid response from admin dashboard: {0}")]
    InvalidResponse(String),

    #[error("failed to create HTTP client: {0}")]
    Client(String),

    #[error("terminal is not configured")]
    NotConfigured,
}

impl ApiError {
    /// HTTP status code carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Unexpected failure of a whole sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Failures installing the tracing subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot create log directory {path}: {source}")]
    LogDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}
