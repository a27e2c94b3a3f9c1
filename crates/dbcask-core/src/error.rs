//! Error types for the prepare/resolve pipeline.

/// Top-level error for all `dbcask-core` operations. Mirrors the teacher's
/// per-crate `Error` enum shape, with `#[from]` conversions from every lower
/// crate this one composes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("registry error: {0}")]
    Registry(#[from] dbcask_registry::Error),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] dbcask_snapshot_traits::Error),

    #[error("runtime error: {0}")]
    Runtime(#[from] dbcask_runtime::Error),

    #[error("connector error: {0}")]
    Connector(#[from] dbcask_connector::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("generic error: {0}")]
    Generic(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict(message.into())
    }

    pub fn integrity<S: Into<String>>(message: S) -> Self {
        Self::Integrity(message.into())
    }

    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
