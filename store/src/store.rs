//! Core Store implementation and the read-only write guard

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use crate::{
    DEFAULT_BUSY_TIMEOUT_MS, Environment, EnvironmentId, EnvironmentRequest, Fingerprint, Resolution,
    ResolvedEnvironment, StoreError, StoreResult,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS environments (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    name             TEXT NOT NULL UNIQUE,
    fingerprint      TEXT NOT NULL,
    system_packages  TEXT NOT NULL DEFAULT '',
    language_version TEXT NOT NULL DEFAULT '',
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS test_files (
    environment_id INTEGER NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
    path           TEXT NOT NULL,
    registered_at  INTEGER NOT NULL,
    PRIMARY KEY (environment_id, path)
);
";

const ENVIRONMENT_COLUMNS: &str =
    "id, name, fingerprint, system_packages, language_version, created_at, updated_at";

/// How a store handle was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Controller or uncoordinated run; may create and update records
    ReadWrite,
    /// Worker run; every write path is refused
    ReadOnly,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadWrite => write!(f, "read-write"),
            Self::ReadOnly => write!(f, "read-only"),
        }
    }
}

/// Handle to the shared environment store
pub struct Store {
    conn: Connection,
    path: PathBuf,
    mode: AccessMode,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: EnvironmentId(row.get(0)?),
        name: row.get(1)?,
        fingerprint: Fingerprint::from(row.get::<_, String>(2)?),
        system_packages: row.get(3)?,
        language_version: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl Store {
    /// Open (creating if needed) a writable store
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "Store::open: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        info!(?path, "Opened store read-write");
        Ok(Self {
            conn,
            path,
            mode: AccessMode::ReadWrite,
        })
    }

    /// Open an existing store for reading only
    ///
    /// Fails if the database does not exist; a worker never creates it.
    pub fn open_read_only(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "Store::open_read_only: called");
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;

        info!(?path, "Opened store read-only");
        Ok(Self {
            conn,
            path,
            mode: AccessMode::ReadOnly,
        })
    }

    /// Open with the given access mode
    pub fn open_with_mode(path: impl AsRef<Path>, mode: AccessMode) -> StoreResult<Self> {
        match mode {
            AccessMode::ReadWrite => Self::open(path),
            AccessMode::ReadOnly => Self::open_read_only(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == AccessMode::ReadOnly
    }

    fn guard_write(&self, operation: &'static str) -> StoreResult<()> {
        if self.is_read_only() {
            warn!(path = ?self.path, operation, "Store::guard_write: write refused on read-only handle");
            return Err(StoreError::ReadOnly {
                path: self.path.display().to_string(),
                operation,
            });
        }
        Ok(())
    }

    /// Look up an environment by name
    pub fn environment(&self, name: &str) -> StoreResult<Option<Environment>> {
        debug!(%name, "Store::environment: called");
        let env = self
            .conn
            .query_row(
                &format!("SELECT {} FROM environments WHERE name = ?1", ENVIRONMENT_COLUMNS),
                params![name],
                environment_from_row,
            )
            .optional()?;
        Ok(env)
    }

    /// Look up an environment by id
    pub fn environment_by_id(&self, id: EnvironmentId) -> StoreResult<Option<Environment>> {
        debug!(%id, "Store::environment_by_id: called");
        let env = self
            .conn
            .query_row(
                &format!("SELECT {} FROM environments WHERE id = ?1", ENVIRONMENT_COLUMNS),
                params![id.0],
                environment_from_row,
            )
            .optional()?;
        Ok(env)
    }

    /// Resolve the environment named in `request`, creating or updating it when writable
    ///
    /// On a read-only handle this never writes: a missing environment is an
    /// error, a fingerprint mismatch returns the stored record unchanged.
    pub fn resolve_environment(&self, request: &EnvironmentRequest) -> StoreResult<ResolvedEnvironment> {
        debug!(
            name = %request.name,
            fingerprint = %request.fingerprint,
            mode = %self.mode,
            "Store::resolve_environment: called"
        );
        let existing = self.environment(&request.name)?;

        if self.is_read_only() {
            return match existing {
                None => {
                    warn!(name = %request.name, "Store::resolve_environment: environment missing in read-only store");
                    Err(StoreError::MissingEnvironment {
                        name: request.name.clone(),
                    })
                }
                Some(environment) if environment.fingerprint != request.fingerprint => {
                    warn!(
                        name = %request.name,
                        stored = %environment.fingerprint,
                        requested = %request.fingerprint,
                        "Environment fingerprint differs; using stored record without writing"
                    );
                    Ok(ResolvedEnvironment {
                        environment,
                        resolution: Resolution::StaleReadOnly {
                            requested: request.fingerprint.clone(),
                        },
                    })
                }
                Some(environment) => {
                    debug!("Store::resolve_environment: read-only hit, fingerprint matches");
                    Ok(ResolvedEnvironment {
                        environment,
                        resolution: Resolution::Unchanged,
                    })
                }
            };
        }

        match existing {
            None => {
                let now = now_millis();
                self.conn.execute(
                    "INSERT INTO environments
                         (name, fingerprint, system_packages, language_version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        request.name,
                        request.fingerprint.as_str(),
                        request.system_packages,
                        request.language_version,
                        now
                    ],
                )?;
                let id = EnvironmentId(self.conn.last_insert_rowid());
                info!(name = %request.name, %id, "Created environment");
                Ok(ResolvedEnvironment {
                    environment: Environment {
                        id,
                        name: request.name.clone(),
                        fingerprint: request.fingerprint.clone(),
                        system_packages: request.system_packages.clone(),
                        language_version: request.language_version.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                    resolution: Resolution::Created,
                })
            }
            Some(environment) if environment.fingerprint != request.fingerprint => {
                let now = now_millis();
                let tx = self.conn.unchecked_transaction()?;
                tx.execute(
                    "UPDATE environments
                     SET fingerprint = ?1, system_packages = ?2, language_version = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![
                        request.fingerprint.as_str(),
                        request.system_packages,
                        request.language_version,
                        now,
                        environment.id.0
                    ],
                )?;
                // Registered files belong to the old snapshot
                tx.execute("DELETE FROM test_files WHERE environment_id = ?1", params![environment.id.0])?;
                tx.commit()?;

                info!(
                    name = %request.name,
                    id = %environment.id,
                    previous = %environment.fingerprint,
                    current = %request.fingerprint,
                    "Updated environment fingerprint"
                );
                let previous = environment.fingerprint.clone();
                Ok(ResolvedEnvironment {
                    environment: Environment {
                        fingerprint: request.fingerprint.clone(),
                        system_packages: request.system_packages.clone(),
                        language_version: request.language_version.clone(),
                        updated_at: now,
                        ..environment
                    },
                    resolution: Resolution::Updated { previous },
                })
            }
            Some(environment) => {
                debug!("Store::resolve_environment: environment unchanged");
                Ok(ResolvedEnvironment {
                    environment,
                    resolution: Resolution::Unchanged,
                })
            }
        }
    }

    /// Register test files under an environment, returning how many were new
    pub fn register_test_files(&self, environment: EnvironmentId, files: &[String]) -> StoreResult<usize> {
        debug!(%environment, count = files.len(), "Store::register_test_files: called");
        self.guard_write("register test files")?;

        let tx = self.conn.unchecked_transaction()?;
        let now = now_millis();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO test_files (environment_id, path, registered_at) VALUES (?1, ?2, ?3)",
            )?;
            for file in files {
                inserted += stmt.execute(params![environment.0, file, now])?;
            }
        }
        tx.commit()?;

        debug!(inserted, "Store::register_test_files: done");
        Ok(inserted)
    }

    /// List registered test files for an environment, sorted by path
    pub fn test_files(&self, environment: EnvironmentId) -> StoreResult<Vec<String>> {
        debug!(%environment, "Store::test_files: called");
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM test_files WHERE environment_id = ?1 ORDER BY path")?;
        let files = stmt
            .query_map(params![environment.0], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }
}
