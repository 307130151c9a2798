//! Worker-side coordination

use std::path::Path;

use envstore::{EnvironmentId, Store};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordination::{CoordinationManager, CoordinationState};
use crate::error::{CoordError, CoordResult};

/// One worker's view of the coordination protocol
#[derive(Debug)]
pub struct WorkerCoordination {
    worker_id: String,
    manager: CoordinationManager,
    state: Option<CoordinationState>,
}

impl WorkerCoordination {
    pub fn new(worker_id: impl Into<String>, root: &Path, config: Config) -> Self {
        let worker_id = worker_id.into();
        debug!(%worker_id, ?root, "WorkerCoordination::new: called");
        Self {
            worker_id,
            manager: CoordinationManager::new(root, config),
            state: None,
        }
    }

    pub fn with_manager(worker_id: impl Into<String>, manager: CoordinationManager) -> Self {
        Self {
            worker_id: worker_id.into(),
            manager,
            state: None,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn manager(&self) -> &CoordinationManager {
        &self.manager
    }

    /// Wait for the controller's state and acknowledge it
    ///
    /// Each poll reads the state and, once present, writes this worker's ack.
    /// A failed ack write is retried on the next poll. Fails with
    /// [`CoordError::ControllerTimeout`] after the worker timeout.
    pub fn wait_and_initialize(&mut self) -> CoordResult<&CoordinationState> {
        debug!(worker_id = %self.worker_id, "WorkerCoordination::wait_and_initialize: called");
        let timeout = self.manager.config().worker_timeout();
        let manager = &self.manager;
        let worker_id = self.worker_id.as_str();

        let result = manager.wait_for(
            || {
                let state = manager.read_state()?;
                match manager.publish_ack(worker_id) {
                    Ok(()) => Some(state),
                    Err(e) => {
                        debug!(%worker_id, error = %e, "wait_and_initialize: ack write failed, retrying");
                        None
                    }
                }
            },
            timeout,
        );

        match result {
            Ok(state) => {
                info!(
                    worker_id = %self.worker_id,
                    environment_id = %state.environment_id,
                    test_files = state.test_files.len(),
                    "Worker acknowledged controller state"
                );
                Ok(&*self.state.insert(state))
            }
            Err(e) => {
                let acks_seen = self.manager.count_acks();
                warn!(
                    worker_id = %self.worker_id,
                    elapsed = ?e.elapsed,
                    attempts = e.attempts,
                    acks_seen,
                    "Timed out waiting for controller state"
                );
                Err(CoordError::ControllerTimeout {
                    worker_id: self.worker_id.clone(),
                    timeout,
                    acks_seen,
                    state_path: self.manager.state_path(),
                })
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&CoordinationState> {
        self.state.as_ref()
    }

    pub fn environment_id(&self) -> Option<EnvironmentId> {
        self.state.as_ref().map(|s| s.environment_id)
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.state.as_ref().map(|s| s.store_path())
    }

    /// Test files discovered by the controller; empty before initialization
    pub fn test_files(&self) -> &[String] {
        self.state.as_ref().map(|s| s.test_files.as_slice()).unwrap_or_default()
    }

    /// A value the controller published under `extra`
    pub fn precreated_data(&self, key: &str) -> Option<&Value> {
        self.state.as_ref().and_then(|s| s.extra.get(key))
    }

    /// Read-only handle to the store the controller published
    pub fn open_store(&self) -> CoordResult<Store> {
        let path = self
            .store_path()
            .ok_or_else(|| CoordError::NotInitialized(self.worker_id.clone()))?;
        debug!(worker_id = %self.worker_id, ?path, "WorkerCoordination::open_store: called");
        Ok(Store::open_read_only(path)?)
    }
}
