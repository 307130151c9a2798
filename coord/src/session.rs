//! Per-run session context
//!
//! A [`Session`] owns everything one process needs for a run: its role, its
//! store handle, and the resolved environment. Callers hold it explicitly and
//! pass it down; nothing is kept in process-wide state.

use std::path::Path;

use envstore::{Environment, EnvironmentRequest, ResolvedEnvironment, Store};
use tracing::{debug, error, info, warn};

use crate::config::{Config, WorkerTimeoutPolicy};
use crate::controller::{ControllerPreCreation, Prepared};
use crate::discovery::TestFileDiscovery;
use crate::error::{CoordError, CoordResult};
use crate::worker::WorkerCoordination;

/// Set for worker processes; the worker's id
pub const ENV_WORKER_ID: &str = "RUNCOORD_WORKER_ID";
/// Set for the controller; how many workers it starts
pub const ENV_WORKERS: &str = "RUNCOORD_WORKERS";

/// What this process is in a coordinated run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// No coordination; a single process owns the store
    Disabled,
    Controller { workers: usize },
    Worker { id: String },
}

impl Role {
    /// Detect the role from the process environment
    pub fn detect(config: &Config) -> Self {
        Self::detect_with(config, |key| std::env::var(key).ok())
    }

    /// Detect the role from a variable lookup
    ///
    /// A worker id wins over a worker count. A controller with zero workers
    /// has nobody to coordinate with and runs disabled.
    pub fn detect_with<F>(config: &Config, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if !config.enabled {
            return Self::Disabled;
        }

        if let Some(id) = lookup(ENV_WORKER_ID)
            && !id.trim().is_empty()
        {
            return Self::Worker { id: id.trim().to_string() };
        }

        match lookup(ENV_WORKERS).map(|raw| raw.trim().parse::<usize>()) {
            Some(Ok(workers)) if workers > 0 => Self::Controller { workers },
            Some(Err(e)) => {
                warn!(key = ENV_WORKERS, error = %e, "Ignoring invalid worker count");
                Self::Disabled
            }
            _ => Self::Disabled,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Controller { workers } => write!(f, "controller ({} workers)", workers),
            Self::Worker { id } => write!(f, "worker {}", id),
        }
    }
}

/// Controller side of a run; cleans up the coordination directory when dropped
#[derive(Debug)]
pub struct ControllerSession {
    controller: ControllerPreCreation,
    store: Store,
    prepared: Prepared,
}

impl ControllerSession {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn prepared(&self) -> &Prepared {
        &self.prepared
    }

    pub fn controller(&self) -> &ControllerPreCreation {
        &self.controller
    }
}

impl Drop for ControllerSession {
    fn drop(&mut self) {
        debug!("ControllerSession::drop: called");
        self.controller.cleanup();
    }
}

/// Worker side of a run
#[derive(Debug)]
pub struct WorkerSession {
    coordination: WorkerCoordination,
    store: Store,
    environment: ResolvedEnvironment,
}

impl WorkerSession {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn coordination(&self) -> &WorkerCoordination {
        &self.coordination
    }

    pub fn resolved(&self) -> &ResolvedEnvironment {
        &self.environment
    }
}

/// A started run in one of its three shapes
#[derive(Debug)]
pub enum Session {
    /// Coordination off: read-write store, no files exchanged
    Uncoordinated { store: Store, environment: ResolvedEnvironment },
    Controller(ControllerSession),
    Worker(WorkerSession),
}

impl Session {
    /// Start a session for `role`
    ///
    /// Controllers pre-create and publish, then wait (softly) for workers.
    /// Workers wait for the controller and resolve their environment through
    /// a read-only handle. A worker that never sees the controller fails with
    /// `ControllerTimeout` unless the timeout policy is `uncoordinated`.
    pub fn start(
        config: &Config,
        role: Role,
        root: &Path,
        store_path: &Path,
        request: &EnvironmentRequest,
        discovery: Box<dyn TestFileDiscovery>,
    ) -> CoordResult<Self> {
        debug!(%role, ?root, ?store_path, "Session::start: called");
        match role {
            Role::Disabled => Self::uncoordinated(store_path, request),
            Role::Controller { workers } => {
                let controller = ControllerPreCreation::with_discovery(root, config.clone(), discovery);
                let started = Store::open(store_path).map_err(CoordError::from).and_then(|store| {
                    let prepared = controller.prepare_for_workers(&store, request, workers)?;
                    Ok((prepared, store))
                });
                match started {
                    Ok((prepared, store)) => Ok(Self::Controller(ControllerSession {
                        controller,
                        store,
                        prepared,
                    })),
                    Err(e) => {
                        controller.cleanup();
                        Err(e)
                    }
                }
            }
            Role::Worker { id } => {
                let mut coordination = WorkerCoordination::new(id, root, config.clone());
                match coordination.wait_and_initialize() {
                    Ok(_) => {}
                    Err(e) if e.is_timeout() && config.worker_timeout_policy == WorkerTimeoutPolicy::Uncoordinated => {
                        error!(
                            error = %e,
                            "Controller never published its state; continuing uncoordinated with a read-write store"
                        );
                        return Self::uncoordinated(store_path, request);
                    }
                    Err(e) => return Err(e),
                }

                let store = coordination.open_store()?;
                let environment = store.resolve_environment(request)?;
                if coordination.environment_id() != Some(environment.environment.id) {
                    warn!(
                        published = ?coordination.environment_id(),
                        resolved = %environment.environment.id,
                        "Resolved environment differs from the one the controller published"
                    );
                }
                info!(
                    worker_id = %coordination.worker_id(),
                    environment = %environment.environment.name,
                    resolution = %environment.resolution,
                    "Worker session ready"
                );
                Ok(Self::Worker(WorkerSession {
                    coordination,
                    store,
                    environment,
                }))
            }
        }
    }

    fn uncoordinated(store_path: &Path, request: &EnvironmentRequest) -> CoordResult<Self> {
        let store = Store::open(store_path)?;
        let environment = store.resolve_environment(request)?;
        Ok(Self::Uncoordinated { store, environment })
    }

    pub fn store(&self) -> &Store {
        match self {
            Self::Uncoordinated { store, .. } => store,
            Self::Controller(session) => &session.store,
            Self::Worker(session) => &session.store,
        }
    }

    pub fn environment(&self) -> &Environment {
        match self {
            Self::Uncoordinated { environment, .. } => &environment.environment,
            Self::Controller(session) => &session.prepared.environment,
            Self::Worker(session) => &session.environment.environment,
        }
    }

    pub fn is_coordinated(&self) -> bool {
        !matches!(self, Self::Uncoordinated { .. })
    }

    /// End the run; a controller removes the coordination directory
    pub fn finish(self) {
        debug!("Session::finish: called");
        drop(self);
    }
}
