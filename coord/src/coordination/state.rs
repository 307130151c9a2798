//! Persisted coordination records
//!
//! Both records are JSON documents with named fields. Unknown fields are
//! ignored on read so newer writers stay readable by older readers within the
//! same `schema_version`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use envstore::EnvironmentId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the controller state inside the coordination directory
pub const STATE_FILE_NAME: &str = "controller_ready.json";

const ACK_PREFIX: &str = "worker_";
const ACK_SUFFIX: &str = "_ready.json";

/// The record the controller publishes once per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationState {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub controller_pid: u32,
    pub environment_id: EnvironmentId,
    pub store_path: PathBuf,
    pub expected_worker_count: usize,
    #[serde(default)]
    pub test_files: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl CoordinationState {
    /// Create a state stamped with the current time and process id
    pub fn new(environment_id: EnvironmentId, store_path: impl Into<PathBuf>, expected_worker_count: usize) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now(),
            controller_pid: std::process::id(),
            environment_id,
            store_path: store_path.into(),
            expected_worker_count,
            test_files: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_test_files(mut self, test_files: Vec<String>) -> Self {
        self.test_files = test_files;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Age relative to `now`; a timestamp from the future counts as age zero
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Older than `max_age` at `now`
    pub fn is_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age_at(now) > max_age
    }

    /// Schema checks beyond what deserialization enforces
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema_version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err("store_path is empty".to_string());
        }
        Ok(())
    }
}

/// Ack status; only `ready` exists today
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ready,
}

/// One worker's acknowledgment of the controller state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAck {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: AckStatus,
    #[serde(default)]
    pub pid: u32,
}

impl WorkerAck {
    pub fn ready(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
            status: AckStatus::Ready,
            pid: std::process::id(),
        }
    }

    pub fn is_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO) > max_age
    }
}

/// Ack file name for a worker id
///
/// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so distinct ids always
/// map to distinct names and no id can escape the directory.
pub fn ack_file_name(worker_id: &str) -> String {
    let mut escaped = String::with_capacity(worker_id.len());
    for byte in worker_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    format!("{}{}{}", ACK_PREFIX, escaped, ACK_SUFFIX)
}

/// Whether a directory entry name looks like an ack file
pub fn is_ack_file_name(name: &str) -> bool {
    name.len() > ACK_PREFIX.len() + ACK_SUFFIX.len() && name.starts_with(ACK_PREFIX) && name.ends_with(ACK_SUFFIX)
}
