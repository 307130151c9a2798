//! Controller-side pre-creation
//!
//! The controller is the only writer. Before any worker touches the store it
//! resolves the environment, registers the discovered test files, and then
//! publishes a [`CoordinationState`] describing what it created.

use std::path::{Path, PathBuf};

use envstore::{Environment, EnvironmentRequest, Resolution, Store, StoreError};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordination::{CoordinationManager, CoordinationState};
use crate::discovery::{PatternDiscovery, TestFileDiscovery};
use crate::error::CoordResult;

/// Outcome of [`ControllerPreCreation::prepare_for_workers`]
#[derive(Debug, Clone)]
pub struct Prepared {
    pub state: CoordinationState,
    pub environment: Environment,
    pub resolution: Resolution,
    /// Workers that acknowledged before the wait ended
    pub acknowledged: usize,
    /// False when the ack wait timed out
    pub all_acknowledged: bool,
}

/// Performs every write workers would otherwise need
pub struct ControllerPreCreation {
    manager: CoordinationManager,
    root: PathBuf,
    discovery: Box<dyn TestFileDiscovery>,
}

impl std::fmt::Debug for ControllerPreCreation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerPreCreation")
            .field("manager", &self.manager)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ControllerPreCreation {
    /// Controller using pattern-based discovery
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        Self::with_discovery(root, config, Box::new(PatternDiscovery::default()))
    }

    pub fn with_discovery(root: impl Into<PathBuf>, config: Config, discovery: Box<dyn TestFileDiscovery>) -> Self {
        let root = root.into();
        debug!(?root, "ControllerPreCreation::new: called");
        let manager = CoordinationManager::new(&root, config);
        Self {
            manager,
            root,
            discovery,
        }
    }

    pub fn manager(&self) -> &CoordinationManager {
        &self.manager
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create everything workers need, publish it, and wait for their acks
    ///
    /// The ack wait is soft: on timeout the run proceeds with
    /// `all_acknowledged == false`.
    pub fn prepare_for_workers(
        &self,
        store: &Store,
        request: &EnvironmentRequest,
        expected_workers: usize,
    ) -> CoordResult<Prepared> {
        debug!(
            environment = %request.name,
            expected_workers,
            "ControllerPreCreation::prepare_for_workers: called"
        );

        if store.is_read_only() {
            return Err(StoreError::ReadOnly {
                path: store.path().display().to_string(),
                operation: "pre-create environment",
            }
            .into());
        }

        // Nothing from a previous run may be visible while pre-creation runs
        self.manager.reset_state()?;
        self.manager.reset_acks();

        let resolved = store.resolve_environment(request)?;
        let environment = resolved.environment;
        info!(
            environment = %environment.name,
            id = %environment.id,
            resolution = %resolved.resolution,
            "Pre-created environment"
        );

        let test_files = self.discovery.discover(&self.root);
        let registered = store.register_test_files(environment.id, &test_files)?;
        debug!(discovered = test_files.len(), registered, "Registered test files");

        let state = CoordinationState::new(environment.id, store.path(), expected_workers)
            .with_extra("environment_name", environment.name.clone())
            .with_extra("fingerprint", environment.fingerprint.as_str())
            .with_extra("resolution", resolved.resolution.to_string())
            .with_extra("test_file_count", json!(test_files.len()))
            .with_extra("root_dir", self.root.display().to_string())
            .with_test_files(test_files);
        self.manager.publish_state(&state)?;

        let (acknowledged, all_acknowledged) = self.wait_for_workers(expected_workers);

        Ok(Prepared {
            state,
            environment,
            resolution: resolved.resolution,
            acknowledged,
            all_acknowledged,
        })
    }

    /// Poll until `expected` acks exist or the worker timeout passes
    fn wait_for_workers(&self, expected: usize) -> (usize, bool) {
        if expected == 0 {
            return (0, true);
        }

        let timeout = self.manager.config().worker_timeout();
        let result = self.manager.wait_for(
            || {
                let seen = self.manager.count_acks();
                (seen >= expected).then_some(seen)
            },
            timeout,
        );

        match result {
            Ok(seen) => {
                info!(seen, expected, "All workers acknowledged");
                (seen, true)
            }
            Err(e) => {
                let seen = self.manager.count_acks();
                warn!(
                    seen,
                    expected,
                    elapsed = ?e.elapsed,
                    "Timed out waiting for worker acknowledgments, continuing"
                );
                (seen, false)
            }
        }
    }

    /// Remove the coordination directory
    pub fn cleanup(&self) {
        self.manager.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::NoDiscovery;
    use envstore::EnvironmentId;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn fast_config(timeout_secs: f64) -> Config {
        Config {
            enabled: true,
            worker_timeout_secs: timeout_secs,
            check_interval_secs: 0.01,
            max_interval_secs: 0.05,
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_without_workers_publishes_state() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("tests")).unwrap();
        fs::write(temp.path().join("tests/test_one.py"), "").unwrap();

        let store = Store::open(temp.path().join("store.db")).unwrap();
        let controller = ControllerPreCreation::new(temp.path(), fast_config(5.0));
        let request = EnvironmentRequest::new("default", "pytest==8.2", "3.12");

        let prepared = controller.prepare_for_workers(&store, &request, 0).unwrap();
        assert!(prepared.all_acknowledged);
        assert_eq!(prepared.resolution, Resolution::Created);
        assert_eq!(prepared.state.test_files, vec!["tests/test_one.py"]);
        assert_eq!(prepared.state.extra["environment_name"], "default");
        assert_eq!(prepared.state.extra["test_file_count"], 1);
        assert_eq!(prepared.state.extra["resolution"], "created");

        let published = controller.manager().read_state().unwrap();
        assert_eq!(published, prepared.state);
        assert_eq!(
            store.test_files(prepared.environment.id).unwrap(),
            vec!["tests/test_one.py"]
        );
    }

    #[test]
    fn test_prepare_rejects_read_only_store() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.db");
        Store::open(&path).unwrap();
        let store = Store::open_read_only(&path).unwrap();

        let controller = ControllerPreCreation::with_discovery(temp.path(), fast_config(5.0), Box::new(NoDiscovery));
        let request = EnvironmentRequest::new("default", "a", "b");
        let err = controller.prepare_for_workers(&store, &request, 0).unwrap_err();
        assert!(err.to_string().contains("read-only"), "{}", err);
        assert!(controller.manager().read_state().is_none());
    }

    #[test]
    fn test_ack_timeout_is_soft() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store.db")).unwrap();
        let controller = ControllerPreCreation::with_discovery(temp.path(), fast_config(0.3), Box::new(NoDiscovery));
        let request = EnvironmentRequest::new("default", "a", "b");

        let start = Instant::now();
        let prepared = controller.prepare_for_workers(&store, &request, 2).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(290));
        assert!(!prepared.all_acknowledged);
        assert_eq!(prepared.acknowledged, 0);
        assert!(controller.manager().read_state().is_some());
    }

    #[test]
    fn test_prepare_clears_leftover_acks() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store.db")).unwrap();
        let controller = ControllerPreCreation::with_discovery(temp.path(), fast_config(0.2), Box::new(NoDiscovery));
        controller.manager().publish_ack("gw0").unwrap();
        controller.manager().publish_ack("gw1").unwrap();

        let request = EnvironmentRequest::new("default", "a", "b");
        let prepared = controller.prepare_for_workers(&store, &request, 2).unwrap();
        assert!(!prepared.all_acknowledged);
    }

    /// Records whether a previous run's state was still visible during discovery
    struct StateObserver {
        state_path: PathBuf,
        saw_state: Arc<AtomicBool>,
    }

    impl TestFileDiscovery for StateObserver {
        fn discover(&self, _root: &Path) -> Vec<String> {
            self.saw_state.store(self.state_path.exists(), Ordering::SeqCst);
            Vec::new()
        }
    }

    #[test]
    fn test_prepare_removes_leftover_state_before_pre_creation() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store.db")).unwrap();
        let manager = CoordinationManager::new(temp.path(), fast_config(5.0));
        manager
            .publish_state(&CoordinationState::new(EnvironmentId(99), temp.path().join("old.db"), 1))
            .unwrap();
        assert!(manager.read_state().is_some());

        let saw_state = Arc::new(AtomicBool::new(true));
        let discovery = StateObserver {
            state_path: manager.state_path(),
            saw_state: Arc::clone(&saw_state),
        };
        let controller = ControllerPreCreation::with_discovery(temp.path(), fast_config(5.0), Box::new(discovery));
        let request = EnvironmentRequest::new("default", "a", "b");
        let prepared = controller.prepare_for_workers(&store, &request, 0).unwrap();

        assert!(!saw_state.load(Ordering::SeqCst));
        let published = controller.manager().read_state().unwrap();
        assert_eq!(published.environment_id, prepared.environment.id);
        assert_ne!(published.environment_id, EnvironmentId(99));
    }

    #[test]
    fn test_cleanup_removes_directory() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store.db")).unwrap();
        let controller = ControllerPreCreation::with_discovery(temp.path(), fast_config(5.0), Box::new(NoDiscovery));
        let request = EnvironmentRequest::new("default", "a", "b");
        controller.prepare_for_workers(&store, &request, 0).unwrap();
        assert!(controller.manager().dir().exists());

        controller.cleanup();
        assert!(!controller.manager().dir().exists());
        controller.cleanup();
    }
}
