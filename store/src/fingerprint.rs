//! Environment fingerprints

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier characterizing an environment's dependency/configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint from the installed packages and language version
    ///
    /// Fields are length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
    pub fn compute(system_packages: &str, language_version: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [system_packages, language_version] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
