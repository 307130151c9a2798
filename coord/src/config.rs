//! Coordination configuration types and loading
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `RUNCOORD_*` environment variables. Loading never fails; a value that
//! cannot be parsed or breaks an invariant falls back to its default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::coordination::{STATE_FILE_NAME, ack_file_name};

/// Enables controller pre-creation and worker coordination
pub const ENV_ENABLED: &str = "RUNCOORD_ENABLED";
/// Enables verbose coordination logging
pub const ENV_DEBUG: &str = "RUNCOORD_DEBUG";
/// Seconds either side waits before giving up
pub const ENV_WORKER_TIMEOUT: &str = "RUNCOORD_WORKER_TIMEOUT";
/// Initial poll interval in seconds
pub const ENV_CHECK_INTERVAL: &str = "RUNCOORD_CHECK_INTERVAL";
/// Multiplier applied to the poll interval after each miss
pub const ENV_BACKOFF_FACTOR: &str = "RUNCOORD_BACKOFF_FACTOR";
/// Upper bound for the poll interval in seconds
pub const ENV_MAX_INTERVAL: &str = "RUNCOORD_MAX_INTERVAL";
/// Overrides the coordination directory
pub const ENV_DIR: &str = "RUNCOORD_DIR";
/// `abort` or `uncoordinated`
pub const ENV_WORKER_TIMEOUT_POLICY: &str = "RUNCOORD_WORKER_TIMEOUT_POLICY";

/// Directory created under the project root when no override is set
pub const COORDINATION_DIR_NAME: &str = ".runcoord";
/// Project-local config file name
pub const CONFIG_FILE_NAME: &str = "runcoord.yml";

const DEFAULT_WORKER_TIMEOUT_SECS: f64 = 30.0;
const DEFAULT_CHECK_INTERVAL_SECS: f64 = 0.1;
const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
const DEFAULT_MAX_INTERVAL_SECS: f64 = 2.0;

/// What a worker does when the controller never publishes its state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTimeoutPolicy {
    /// Fail the worker's session with a timeout error
    #[default]
    Abort,
    /// Log an error and continue as an uncoordinated read-write run
    Uncoordinated,
}

impl std::str::FromStr for WorkerTimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "uncoordinated" | "fallback" => Ok(Self::Uncoordinated),
            other => Err(format!("unknown worker timeout policy: {}", other)),
        }
    }
}

impl std::fmt::Display for WorkerTimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Abort => write!(f, "abort"),
            Self::Uncoordinated => write!(f, "uncoordinated"),
        }
    }
}

/// Coordination configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether coordination is active at all
    pub enabled: bool,

    /// Verbose coordination logging
    pub debug: bool,

    /// How long a worker waits for the controller, and the controller for acks
    #[serde(rename = "worker-timeout")]
    pub worker_timeout_secs: f64,

    /// First poll interval
    #[serde(rename = "check-interval")]
    pub check_interval_secs: f64,

    /// Poll interval multiplier
    #[serde(rename = "backoff-factor")]
    pub backoff_factor: f64,

    /// Poll interval cap
    #[serde(rename = "max-interval")]
    pub max_interval_secs: f64,

    /// Coordination directory; relative paths are resolved against the project root
    #[serde(rename = "coordination-dir")]
    pub coordination_dir: Option<PathBuf>,

    /// Worker behavior on controller timeout
    #[serde(rename = "worker-timeout-policy")]
    pub worker_timeout_policy: WorkerTimeoutPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            debug: false,
            worker_timeout_secs: DEFAULT_WORKER_TIMEOUT_SECS,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_interval_secs: DEFAULT_MAX_INTERVAL_SECS,
            coordination_dir: None,
            worker_timeout_policy: WorkerTimeoutPolicy::Abort,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn is_valid_seconds(value: f64) -> bool {
    value > 0.0 && Duration::try_from_secs_f64(value).is_ok()
}

/// Log a rejected value; loud only when debug is on
fn report_invalid(debug_enabled: bool, key: &str, value: &str, reason: &str) {
    if debug_enabled {
        warn!(key, value, reason, "Ignoring invalid coordination setting, using default");
    } else {
        debug!(key, value, reason, "Ignoring invalid coordination setting, using default");
    }
}

impl Config {
    /// Resolve configuration from the process environment only
    pub fn from_env() -> Self {
        debug!("Config::from_env: called");
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Load configuration with fallback chain: explicit file, `./runcoord.yml`,
    /// user config dir, then environment overrides
    pub fn load(config_path: Option<&Path>) -> Self {
        debug!(?config_path, "Config::load: called");
        let base = match config_path {
            Some(path) => Self::load_from_file(path).unwrap_or_default(),
            None => {
                let candidates = [
                    Some(PathBuf::from(CONFIG_FILE_NAME)),
                    dirs::config_dir().map(|p| p.join("runcoord").join(CONFIG_FILE_NAME)),
                ];
                candidates
                    .iter()
                    .flatten()
                    .filter(|path| path.exists())
                    .find_map(|path| Self::load_from_file(path))
                    .unwrap_or_default()
            }
        };

        base.with_env(|key| std::env::var(key).ok())
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read config from {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_yaml::from_str::<Self>(&content) {
            Ok(config) => {
                info!("Loaded config from: {}", path.display());
                Some(config.normalized())
            }
            Err(e) => {
                warn!("Failed to parse config from {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Apply overrides from a variable lookup, then re-check invariants
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Debug first so the remaining fields know how loudly to complain
        if let Some(raw) = lookup(ENV_DEBUG) {
            match parse_bool(&raw) {
                Some(v) => self.debug = v,
                None => report_invalid(true, ENV_DEBUG, &raw, "not a boolean"),
            }
        }
        let loud = self.debug;

        if let Some(raw) = lookup(ENV_ENABLED) {
            match parse_bool(&raw) {
                Some(v) => self.enabled = v,
                None => report_invalid(loud, ENV_ENABLED, &raw, "not a boolean"),
            }
        }

        let floats: [(&str, &mut f64); 4] = [
            (ENV_WORKER_TIMEOUT, &mut self.worker_timeout_secs),
            (ENV_CHECK_INTERVAL, &mut self.check_interval_secs),
            (ENV_BACKOFF_FACTOR, &mut self.backoff_factor),
            (ENV_MAX_INTERVAL, &mut self.max_interval_secs),
        ];
        for (key, slot) in floats {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<f64>() {
                    Ok(v) => *slot = v,
                    Err(_) => report_invalid(loud, key, &raw, "not a number"),
                }
            }
        }

        if let Some(raw) = lookup(ENV_DIR)
            && !raw.trim().is_empty()
        {
            self.coordination_dir = Some(PathBuf::from(raw.trim()));
        }

        if let Some(raw) = lookup(ENV_WORKER_TIMEOUT_POLICY) {
            match raw.parse() {
                Ok(policy) => self.worker_timeout_policy = policy,
                Err(reason) => report_invalid(loud, ENV_WORKER_TIMEOUT_POLICY, &raw, &reason),
            }
        }

        let config = self.normalized();
        if config.debug {
            info!(?config, "Coordination config loaded");
        }
        config
    }

    /// Replace out-of-range values with defaults so every invariant holds
    pub fn normalized(mut self) -> Self {
        let loud = self.debug;

        if !is_valid_seconds(self.worker_timeout_secs) {
            report_invalid(loud, "worker-timeout", &self.worker_timeout_secs.to_string(), "must be > 0");
            self.worker_timeout_secs = DEFAULT_WORKER_TIMEOUT_SECS;
        }
        if !is_valid_seconds(self.check_interval_secs) {
            report_invalid(loud, "check-interval", &self.check_interval_secs.to_string(), "must be > 0");
            self.check_interval_secs = DEFAULT_CHECK_INTERVAL_SECS;
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            report_invalid(loud, "backoff-factor", &self.backoff_factor.to_string(), "must be >= 1.0");
            self.backoff_factor = DEFAULT_BACKOFF_FACTOR;
        }
        if !is_valid_seconds(self.max_interval_secs) || self.max_interval_secs < self.check_interval_secs {
            report_invalid(
                loud,
                "max-interval",
                &self.max_interval_secs.to_string(),
                "must be >= check-interval",
            );
            self.max_interval_secs = DEFAULT_MAX_INTERVAL_SECS.max(self.check_interval_secs);
        }

        self
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.worker_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs_f64(self.max_interval_secs)
    }

    /// Backoff parameters for poll loops
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.check_interval(), self.backoff_factor, self.max_interval())
    }

    /// Coordination directory for a project root
    pub fn coordination_dir(&self, root: &Path) -> PathBuf {
        match &self.coordination_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.join(COORDINATION_DIR_NAME),
        }
    }

    /// Controller state file for a project root
    pub fn state_path(&self, root: &Path) -> PathBuf {
        self.coordination_dir(root).join(STATE_FILE_NAME)
    }

    /// Ack file of one worker for a project root
    pub fn ack_path(&self, root: &Path, worker_id: &str) -> PathBuf {
        self.coordination_dir(root).join(ack_file_name(worker_id))
    }

    /// Serialize as YAML for display
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
