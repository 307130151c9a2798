//! Integration tests for RunCoord
//!
//! These tests run a controller and its workers on threads against one
//! coordination directory and one store file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use envstore::{EnvironmentId, EnvironmentRequest, Resolution, Store, StoreError};
use runcoord::config::{Config, WorkerTimeoutPolicy};
use runcoord::coordination::{CoordinationManager, CoordinationState};
use runcoord::discovery::{NoDiscovery, PatternDiscovery, TestFileDiscovery};
use runcoord::error::CoordError;
use runcoord::session::{Role, Session};
use tempfile::TempDir;

fn config(timeout_secs: f64) -> Config {
    Config {
        enabled: true,
        worker_timeout_secs: timeout_secs,
        check_interval_secs: 0.01,
        backoff_factor: 1.5,
        max_interval_secs: 0.05,
        ..Default::default()
    }
}

fn write_test_files(root: &Path) {
    for rel in ["tests/test_alpha.py", "tests/unit/test_beta.py", "testing/gamma_test.py"] {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).expect("Failed to create test dir");
        std::fs::write(path, "").expect("Failed to write test file");
    }
}

fn start_worker(root: PathBuf, store_path: PathBuf, id: &'static str, config: Config) -> thread::JoinHandle<Session> {
    thread::spawn(move || {
        let request = EnvironmentRequest::new("py312", "pytest==8.3", "3.12");
        Session::start(
            &config,
            Role::Worker { id: id.to_string() },
            &root,
            &store_path,
            &request,
            Box::new(NoDiscovery),
        )
        .expect("Worker session should start")
    })
}

/// Holds the controller inside discovery until the test releases it
struct GatedDiscovery {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl TestFileDiscovery for GatedDiscovery {
    fn discover(&self, _root: &Path) -> Vec<String> {
        self.entered.wait();
        self.release.wait();
        Vec::new()
    }
}

// =============================================================================
// Full protocol
// =============================================================================

#[test]
fn test_controller_and_workers_full_flow() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path().to_path_buf();
    let store_path = root.join("shared.db");
    write_test_files(&root);
    let config = config(10.0);

    // Workers start first and poll until the controller publishes
    let workers: Vec<_> = ["gw0", "gw1"]
        .into_iter()
        .map(|id| start_worker(root.clone(), store_path.clone(), id, config.clone()))
        .collect();

    thread::sleep(Duration::from_millis(50));
    let request = EnvironmentRequest::new("py312", "pytest==8.2", "3.12");
    let controller = Session::start(
        &config,
        Role::Controller { workers: 2 },
        &root,
        &store_path,
        &request,
        Box::new(PatternDiscovery::default()),
    )
    .expect("Controller session should start");

    let Session::Controller(controller_session) = &controller else {
        panic!("expected controller session");
    };
    let prepared = controller_session.prepared();
    assert!(prepared.all_acknowledged);
    assert_eq!(prepared.acknowledged, 2);
    assert_eq!(prepared.resolution, Resolution::Created);
    assert_eq!(prepared.state.test_files.len(), 3);

    let controller_env = controller.environment().clone();

    for handle in workers {
        let session = handle.join().expect("Worker thread panicked");
        let Session::Worker(worker) = &session else {
            panic!("expected worker session");
        };
        assert!(session.store().is_read_only());
        assert_eq!(worker.coordination().environment_id(), Some(controller_env.id));
        assert_eq!(worker.coordination().test_files(), prepared.state.test_files.as_slice());
        assert_eq!(
            worker.coordination().precreated_data("environment_name"),
            Some(&serde_json::Value::from("py312"))
        );

        // Workers asked for pytest==8.3; the controller's record wins untouched
        assert_eq!(session.environment().fingerprint, controller_env.fingerprint);
        assert!(matches!(worker.resolved().resolution, Resolution::StaleReadOnly { .. }));
        session.finish();
    }

    let coordination_dir = root.join(".runcoord");
    assert!(coordination_dir.exists());
    controller.finish();
    assert!(!coordination_dir.exists());
}

#[test]
fn test_worker_guard_refuses_writes_after_coordination() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path().to_path_buf();
    let store_path = root.join("shared.db");
    let config = config(5.0);

    let worker = start_worker(root.clone(), store_path.clone(), "gw0", config.clone());
    let request = EnvironmentRequest::new("py312", "pytest==8.3", "3.12");
    let controller = Session::start(
        &config,
        Role::Controller { workers: 1 },
        &root,
        &store_path,
        &request,
        Box::new(NoDiscovery),
    )
    .expect("Controller session should start");

    let session = worker.join().expect("Worker thread panicked");
    assert_eq!(session.environment().id, controller.environment().id);

    let err = session
        .store()
        .register_test_files(session.environment().id, &["tests/test_new.py".to_string()])
        .unwrap_err();
    assert!(matches!(err, StoreError::ReadOnly { .. }));
    assert!(err.is_guard_violation());

    let missing = session
        .store()
        .resolve_environment(&EnvironmentRequest::new("never-created", "a", "b"))
        .unwrap_err();
    assert!(missing.to_string().contains("never-created"));
    assert!(missing.to_string().contains("controller"));

    session.finish();
    controller.finish();
}

// =============================================================================
// Timeouts and stale leftovers
// =============================================================================

#[test]
fn test_controller_proceeds_when_workers_never_ack() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let request = EnvironmentRequest::new("py312", "a", "b");

    let start = Instant::now();
    let session = Session::start(
        &config(0.5),
        Role::Controller { workers: 3 },
        root,
        &root.join("shared.db"),
        &request,
        Box::new(NoDiscovery),
    )
    .expect("Controller ack timeout should be soft");
    let elapsed = start.elapsed();

    let Session::Controller(controller) = &session else {
        panic!("expected controller session");
    };
    assert!(!controller.prepared().all_acknowledged);
    assert!(elapsed >= Duration::from_millis(490), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
    session.finish();
}

#[test]
fn test_worker_ignores_stale_state_from_crashed_run() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let config = config(0.3);

    let manager = CoordinationManager::new(root, config.clone());
    let mut leftover = CoordinationState::new(EnvironmentId(99), root.join("old.db"), 1);
    leftover.created_at = Utc::now() - TimeDelta::seconds(60);
    manager.publish_state(&leftover).expect("Failed to publish leftover state");

    let err = Session::start(
        &config,
        Role::Worker { id: "gw0".to_string() },
        root,
        &root.join("shared.db"),
        &EnvironmentRequest::new("py312", "a", "b"),
        Box::new(NoDiscovery),
    )
    .unwrap_err();

    assert!(matches!(err, CoordError::ControllerTimeout { .. }));
    let msg = err.to_string();
    assert!(msg.contains("gw0"));
    assert!(msg.contains("RUNCOORD_WORKER_TIMEOUT"));
}

#[test]
fn test_worker_timeout_fallback_policy_runs_uncoordinated() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let config = Config {
        worker_timeout_policy: WorkerTimeoutPolicy::Uncoordinated,
        ..config(0.2)
    };

    let session = Session::start(
        &config,
        Role::Worker { id: "gw0".to_string() },
        root,
        &root.join("shared.db"),
        &EnvironmentRequest::new("py312", "a", "b"),
        Box::new(NoDiscovery),
    )
    .expect("Fallback policy should start uncoordinated");

    assert!(!session.is_coordinated());
    assert!(!session.store().is_read_only());
    assert_eq!(session.environment().name, "py312");
}

#[test]
fn test_controller_rerun_updates_environment_and_clears_old_acks() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let store_path = root.join("shared.db");
    let config = config(0.2);

    // A previous run left acks behind
    let manager = CoordinationManager::new(root, config.clone());
    manager.publish_ack("gw0").expect("Failed to write leftover ack");

    let first = Session::start(
        &config,
        Role::Controller { workers: 1 },
        root,
        &store_path,
        &EnvironmentRequest::new("py312", "pytest==8.2", "3.12"),
        Box::new(NoDiscovery),
    )
    .expect("First controller run");
    let Session::Controller(controller) = &first else {
        panic!("expected controller session");
    };
    assert!(!controller.prepared().all_acknowledged);
    let first_id = first.environment().id;
    first.finish();

    let second = Session::start(
        &config,
        Role::Controller { workers: 0 },
        root,
        &store_path,
        &EnvironmentRequest::new("py312", "pytest==8.3", "3.12"),
        Box::new(NoDiscovery),
    )
    .expect("Second run");
    // Zero workers means nothing to coordinate with, but an explicit role is honored
    let Session::Controller(controller) = &second else {
        panic!("expected controller session");
    };
    assert!(matches!(controller.prepared().resolution, Resolution::Updated { .. }));
    assert_eq!(second.environment().id, first_id);
    second.finish();

    let reader = Store::open_read_only(&store_path).expect("Failed to open store read-only");
    let env = reader.environment("py312").unwrap().unwrap();
    assert_eq!(
        env.fingerprint,
        EnvironmentRequest::new("py312", "pytest==8.3", "3.12").fingerprint
    );
}

#[test]
fn test_worker_never_consumes_fresh_state_from_previous_run() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path().to_path_buf();
    let store_path = root.join("shared.db");
    let config = config(5.0);

    // A run that crashed moments ago left a state that still looks fresh
    let manager = CoordinationManager::new(&root, config.clone());
    let leftover = CoordinationState::new(EnvironmentId(99), root.join("old.db"), 1);
    manager.publish_state(&leftover).expect("Failed to publish leftover state");
    assert!(manager.read_state().is_some());

    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let discovery = GatedDiscovery {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    };
    let controller = {
        let (root, store_path, config) = (root.clone(), store_path.clone(), config.clone());
        thread::spawn(move || {
            Session::start(
                &config,
                Role::Controller { workers: 1 },
                &root,
                &store_path,
                &EnvironmentRequest::new("py312", "pytest==8.3", "3.12"),
                Box::new(discovery),
            )
            .expect("Controller session should start")
        })
    };

    // The controller is mid pre-creation; a worker polling now must not see the old state
    entered.wait();
    assert!(manager.read_state().is_none());
    let worker = start_worker(root.clone(), store_path.clone(), "gw0", config.clone());
    thread::sleep(Duration::from_millis(100));
    release.wait();

    let controller = controller.join().expect("Controller thread panicked");
    let session = worker.join().expect("Worker thread panicked");
    let Session::Worker(worker) = &session else {
        panic!("expected worker session");
    };
    assert_eq!(worker.coordination().environment_id(), Some(controller.environment().id));
    assert_ne!(controller.environment().id, EnvironmentId(99));
    assert_eq!(worker.coordination().store_path(), Some(store_path.as_path()));

    let Session::Controller(controller_session) = &controller else {
        panic!("expected controller session");
    };
    assert!(controller_session.prepared().all_acknowledged);

    session.finish();
    controller.finish();
}
