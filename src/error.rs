//! Error taxonomy for the memory substrate.

use thiserror::Error;

/// Result alias used across the crate.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors surfaced by the memory substrate.
///
/// Kinds mirror the propagation policy: `InvalidArgument`/`LockTimeout`/`IOError`
/// are surfaced to callers, `Timeout`/`DegradedExternal` are recovered locally
/// and only ever show up inside a result envelope's `error` field.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lock timeout acquiring {path}")]
    LockTimeout { path: String },

    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("degraded external dependency: {0}")]
    DegradedExternal(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for MemoryError {
    fn from(e: anyhow::Error) -> Self {
        MemoryError::Other(e.to_string())
    }
}
