//! Coordination error types

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from coordination operations
#[derive(Debug, Error)]
pub enum CoordError {
    #[error(
        "Worker {worker_id} timed out after {timeout:?} waiting for controller state at {}; \
         {acks_seen} worker ack(s) present. \
         Check that the controller is running with coordination enabled, or raise RUNCOORD_WORKER_TIMEOUT",
        .state_path.display()
    )]
    ControllerTimeout {
        worker_id: String,
        timeout: Duration,
        acks_seen: usize,
        state_path: PathBuf,
    },

    #[error("Coordination file error: {operation} failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize coordination data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] envstore::StoreError),

    #[error("Worker {0} not ready: coordination has not completed")]
    NotInitialized(String),
}

impl CoordError {
    pub(crate) fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Check if this is a worker-side timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordError::ControllerTimeout { .. })
    }
}

/// Result alias for coordination operations
pub type CoordResult<T> = Result<T, CoordError>;
