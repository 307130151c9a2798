//! File-based exchange of coordination state and worker acks
//!
//! The only synchronization primitive is `rename`: every file is written to a
//! private temp name and then renamed over its final name, so a reader sees
//! either nothing or a complete document.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{CoordinationState, STATE_FILE_NAME, WorkerAck, ack_file_name, is_ack_file_name};
use crate::backoff::{self, WaitTimeout};
use crate::config::Config;
use crate::error::{CoordError, CoordResult};

/// Reads and writes coordination files under one directory
#[derive(Debug, Clone)]
pub struct CoordinationManager {
    dir: PathBuf,
    config: Config,
}

impl CoordinationManager {
    /// Manager for the coordination directory of a project root
    pub fn new(root: &Path, config: Config) -> Self {
        let dir = config.coordination_dir(root);
        debug!(?dir, "CoordinationManager::new: called");
        Self { dir, config }
    }

    /// Manager for an explicit directory
    pub fn with_dir(dir: impl Into<PathBuf>, config: Config) -> Self {
        let dir = dir.into();
        debug!(?dir, "CoordinationManager::with_dir: called");
        Self { dir, config }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    pub fn ack_path(&self, worker_id: &str) -> PathBuf {
        self.dir.join(ack_file_name(worker_id))
    }

    /// Create the directory; losing a creation race is success
    fn ensure_dir(&self) -> CoordResult<()> {
        match fs::create_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && self.dir.is_dir() => Ok(()),
            Err(e) => Err(CoordError::io(&self.dir, "create directory", e)),
        }
    }

    /// Write `bytes` to `path` via a temp file and rename
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> CoordResult<()> {
        self.ensure_dir()?;

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("coordination");
        let temp_path = self
            .dir
            .join(format!(".{}.{}.{}.tmp", file_name, std::process::id(), Uuid::now_v7()));

        let result = (|| -> io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, path)
        })();

        if let Err(e) = result {
            if let Err(cleanup_err) = fs::remove_file(&temp_path)
                && cleanup_err.kind() != io::ErrorKind::NotFound
            {
                debug!(?temp_path, error = %cleanup_err, "write_atomic: failed to remove temp file");
            }
            return Err(CoordError::io(path, "write", e));
        }
        Ok(())
    }

    /// Publish the controller state, replacing any previous one wholesale
    pub fn publish_state(&self, state: &CoordinationState) -> CoordResult<()> {
        let path = self.state_path();
        debug!(?path, environment_id = %state.environment_id, "CoordinationManager::publish_state: called");
        let json = serde_json::to_vec_pretty(state)?;
        self.write_atomic(&path, &json)?;
        info!(
            ?path,
            environment_id = %state.environment_id,
            expected_workers = state.expected_worker_count,
            "Published controller state"
        );
        Ok(())
    }

    /// Read the controller state if a valid, fresh one is present
    ///
    /// Missing, unreadable, malformed, wrong-version and stale states all
    /// return `None`; callers keep polling either way.
    pub fn read_state(&self) -> Option<CoordinationState> {
        let path = self.state_path();
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(?path, error = %e, "read_state: unreadable");
                return None;
            }
        };

        let state: CoordinationState = match serde_json::from_slice(&content) {
            Ok(state) => state,
            Err(e) => {
                debug!(?path, error = %e, "read_state: malformed");
                return None;
            }
        };

        if let Err(reason) = state.validate() {
            debug!(?path, %reason, "read_state: failed validation");
            return None;
        }

        let now = Utc::now();
        if state.is_stale_at(self.config.worker_timeout(), now) {
            let age = state.age_at(now);
            if self.config.debug {
                warn!(?path, ?age, "Ignoring stale controller state");
            } else {
                debug!(?path, ?age, "read_state: stale");
            }
            return None;
        }

        Some(state)
    }

    /// Write this worker's ack; rewriting refreshes the timestamp
    pub fn publish_ack(&self, worker_id: &str) -> CoordResult<()> {
        let path = self.ack_path(worker_id);
        debug!(%worker_id, ?path, "CoordinationManager::publish_ack: called");
        if worker_id.is_empty() {
            return Err(CoordError::io(
                path,
                "acknowledge",
                io::Error::new(io::ErrorKind::InvalidInput, "worker id is empty"),
            ));
        }
        let json = serde_json::to_vec_pretty(&WorkerAck::ready(worker_id))?;
        self.write_atomic(&path, &json)
    }

    /// All valid, fresh acks in the directory
    pub fn read_acks(&self) -> Vec<WorkerAck> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = ?self.dir, error = %e, "Error scanning for worker acks");
                }
                return Vec::new();
            }
        };

        let now = Utc::now();
        let max_age = self.config.worker_timeout();
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_str().is_some_and(is_ack_file_name))
            .filter_map(|entry| {
                let path = entry.path();
                let content = fs::read(&path).ok()?;
                match serde_json::from_slice::<WorkerAck>(&content) {
                    Ok(ack) if !ack.is_stale_at(max_age, now) => Some(ack),
                    Ok(_) => {
                        debug!(?path, "read_acks: stale ack ignored");
                        None
                    }
                    Err(e) => {
                        debug!(?path, error = %e, "read_acks: malformed ack ignored");
                        None
                    }
                }
            })
            .collect()
    }

    /// Number of workers with a valid ack
    pub fn count_acks(&self) -> usize {
        self.ready_workers().len()
    }

    /// Ids of workers with a valid ack
    pub fn ready_workers(&self) -> BTreeSet<String> {
        self.read_acks().into_iter().map(|ack| ack.worker_id).collect()
    }

    /// Remove a previous run's state file so no worker can pick it up
    ///
    /// Returns whether a file was removed. A missing file is success.
    pub fn reset_state(&self) -> CoordResult<bool> {
        let path = self.state_path();
        debug!(?path, "CoordinationManager::reset_state: called");
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(?path, "Removed leftover controller state");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoordError::io(path, "remove previous state", e)),
        }
    }

    /// Remove every ack file, returning how many were removed
    pub fn reset_acks(&self) -> usize {
        debug!(dir = ?self.dir, "CoordinationManager::reset_acks: called");
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.filter_map(Result::ok) {
            if !entry.file_name().to_str().is_some_and(is_ack_file_name) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to remove worker ack"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed leftover worker acks");
        }
        removed
    }

    /// Poll `check` with this manager's backoff until it yields or `timeout` passes
    pub fn wait_for<T, F>(&self, check: F, timeout: Duration) -> Result<T, WaitTimeout>
    where
        F: FnMut() -> Option<T>,
    {
        backoff::wait_for(&self.config.backoff(), timeout, check)
    }

    /// Remove the coordination directory; never fails
    pub fn cleanup(&self) {
        debug!(dir = ?self.dir, "CoordinationManager::cleanup: called");
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => info!(dir = ?self.dir, "Cleaned up coordination directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("CoordinationManager::cleanup: directory already gone");
            }
            Err(e) => warn!(dir = ?self.dir, error = %e, "Failed to clean up coordination directory"),
        }
    }
}
