//! EnvStore - shared SQLite environment store
//!
//! One process (the controller) owns all writes; any number of worker
//! processes open the same database read-only. The store enforces that split
//! itself: a read-only handle never issues a write, and the one write a worker
//! would otherwise need (resolving its environment record) is turned into
//! either a tolerated stale read or a descriptive error.
//!
//! # Schema
//!
//! ```text
//! environments(id, name UNIQUE, fingerprint, system_packages,
//!              language_version, created_at, updated_at)
//! test_files(environment_id, path, registered_at)  PK(environment_id, path)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use envstore::{EnvironmentRequest, Store};
//!
//! let store = Store::open("runcoord.db")?;
//! let resolved = store.resolve_environment(&EnvironmentRequest::new("default", "pytest==8.2", "3.12"))?;
//!
//! let worker = Store::open_read_only("runcoord.db")?;
//! let same = worker.resolve_environment(&EnvironmentRequest::new("default", "pytest==8.3", "3.12"))?;
//! assert_eq!(same.environment.id, resolved.environment.id);
//! ```

mod environment;
mod error;
mod fingerprint;
mod store;

pub use environment::{Environment, EnvironmentId, EnvironmentRequest, Resolution, ResolvedEnvironment};
pub use error::{StoreError, StoreResult};
pub use fingerprint::Fingerprint;
pub use store::{AccessMode, Store};

/// How long a handle waits on a locked database before giving up
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
