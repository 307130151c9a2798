//! Environment records and resolution outcomes

use serde::{Deserialize, Serialize};

use crate::Fingerprint;

/// Opaque identifier of an environment row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(pub i64);

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EnvironmentId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A persisted environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Row identifier
    pub id: EnvironmentId,
    /// Environment name (unique)
    pub name: String,
    /// Fingerprint stored for this environment
    pub fingerprint: Fingerprint,
    /// Installed package listing the fingerprint was computed from
    pub system_packages: String,
    /// Language/runtime version
    pub language_version: String,
    /// Creation timestamp (unix ms)
    pub created_at: i64,
    /// Last update timestamp (unix ms)
    pub updated_at: i64,
}

/// What the caller wants the environment to look like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRequest {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub system_packages: String,
    pub language_version: String,
}

impl EnvironmentRequest {
    /// Build a request, computing the fingerprint from packages and version
    pub fn new(
        name: impl Into<String>,
        system_packages: impl Into<String>,
        language_version: impl Into<String>,
    ) -> Self {
        let system_packages = system_packages.into();
        let language_version = language_version.into();
        Self {
            name: name.into(),
            fingerprint: Fingerprint::compute(&system_packages, &language_version),
            system_packages,
            language_version,
        }
    }

    /// Build a request with an explicit fingerprint
    pub fn with_fingerprint(name: impl Into<String>, fingerprint: impl Into<Fingerprint>) -> Self {
        Self {
            name: name.into(),
            fingerprint: fingerprint.into(),
            system_packages: String::new(),
            language_version: String::new(),
        }
    }
}

/// How a resolve request was satisfied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// No record existed; one was inserted
    Created,
    /// The record existed with another fingerprint and was rewritten
    Updated { previous: Fingerprint },
    /// The record already matched
    Unchanged,
    /// Read-only handle: record exists but differs from the request, returned as-is
    StaleReadOnly { requested: Fingerprint },
}

impl Resolution {
    /// Whether the stored fingerprint differs from what was requested
    pub fn fingerprint_changed(&self) -> bool {
        matches!(self, Resolution::Updated { .. } | Resolution::StaleReadOnly { .. })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated { .. } => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::StaleReadOnly { .. } => write!(f, "stale_read_only"),
        }
    }
}

/// Result of resolving an environment
#[derive(Debug, Clone)]
pub struct ResolvedEnvironment {
    pub environment: Environment,
    pub resolution: Resolution,
}
