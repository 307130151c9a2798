//! RunCoord - controller/worker coordination over a shared directory
//!
//! One controller process performs every write to a shared store up front,
//! then publishes what it created as a JSON state file. Worker processes poll
//! for that file, acknowledge it, and open the store read-only. Both sides
//! bound their waits with a timeout and capped exponential backoff.
//!
//! # Layout
//!
//! ```text
//! <root>/.runcoord/
//!   controller_ready.json        published once per run by the controller
//!   worker_<id>_ready.json       one per worker
//! ```
//!
//! Every file is written to a temp name and renamed into place, so readers
//! never see a partial document. The controller removes the directory when
//! its session ends.
//!
//! # Example
//!
//! ```ignore
//! use runcoord::{Config, Role, Session, discovery::PatternDiscovery};
//!
//! let config = Config::from_env();
//! let role = Role::detect(&config);
//! let session = Session::start(&config, role, root, store_path, &request, Box::new(PatternDiscovery::default()))?;
//! let environment = session.environment();
//! // ... run tests against session.store() ...
//! session.finish();
//! ```

pub mod backoff;
pub mod cli;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod discovery;
pub mod error;
pub mod session;
pub mod worker;

pub use backoff::{Backoff, BackoffPolicy, WaitTimeout, wait_for};
pub use config::{Config, WorkerTimeoutPolicy};
pub use controller::{ControllerPreCreation, Prepared};
pub use coordination::{CoordinationManager, CoordinationState, WorkerAck};
pub use discovery::{PatternDiscovery, TestFileDiscovery};
pub use error::{CoordError, CoordResult};
pub use session::{ControllerSession, Role, Session, WorkerSession};
pub use worker::WorkerCoordination;
