//! Store error types

use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "Environment '{name}' not found in read-only store; \
         the controller should have pre-created it before workers started"
    )]
    MissingEnvironment { name: String },

    #[error("Store at {path} is read-only; refusing to {operation}")]
    ReadOnly { path: String, operation: &'static str },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Check if this error came from the read-only guard
    pub fn is_guard_violation(&self) -> bool {
        matches!(self, StoreError::MissingEnvironment { .. } | StoreError::ReadOnly { .. })
    }
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
