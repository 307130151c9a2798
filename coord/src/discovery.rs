//! Test-file discovery for the controller's pre-creation step

use std::collections::BTreeSet;
use std::path::Path;

use glob::Pattern;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Finds the test files a run will collect
pub trait TestFileDiscovery: Send + Sync {
    /// Sorted, deduplicated paths relative to `root`
    fn discover(&self, root: &Path) -> Vec<String>;
}

/// Default file-name patterns
pub const DEFAULT_PATTERNS: &[&str] = &["test_*.py", "*_test.py", "tests.py"];

/// Directories under the root searched recursively
pub const DEFAULT_TEST_DIRS: &[&str] = &["tests", "test", "testing"];

/// Glob-based discovery over the conventional test directories
///
/// The configured directories and then the whole root are walked
/// recursively, hidden entries skipped.
#[derive(Debug, Clone)]
pub struct PatternDiscovery {
    patterns: Vec<Pattern>,
    dirs: Vec<String>,
}

impl Default for PatternDiscovery {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().filter_map(|p| Pattern::new(p).ok()).collect(),
            dirs: DEFAULT_TEST_DIRS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl PatternDiscovery {
    /// Discovery with custom patterns; invalid patterns are logged and dropped
    pub fn new<P, D>(patterns: P, dirs: D) -> Self
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|p| match Pattern::new(p.as_ref()) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = p.as_ref(), error = %e, "Ignoring invalid test file pattern");
                    None
                }
            })
            .collect();
        Self {
            patterns,
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, file_name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(file_name))
    }

    fn collect(&self, root: &Path, dir: &Path, max_depth: usize, found: &mut BTreeSet<String>) {
        let walker = WalkDir::new(dir)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|e| e.path() == dir || e.file_name().to_str().is_some_and(|s| !s.starts_with('.')));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !self.matches(name) {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(root) {
                found.insert(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

impl TestFileDiscovery for PatternDiscovery {
    fn discover(&self, root: &Path) -> Vec<String> {
        debug!(?root, "PatternDiscovery::discover: called");
        let mut found = BTreeSet::new();

        for dir in &self.dirs {
            let path = root.join(dir);
            if path.is_dir() {
                self.collect(root, &path, usize::MAX, &mut found);
            }
        }
        self.collect(root, root, usize::MAX, &mut found);

        debug!(count = found.len(), "PatternDiscovery::discover: done");
        found.into_iter().collect()
    }
}

/// Discovery that finds nothing; for runs without test files
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiscovery;

impl TestFileDiscovery for NoDiscovery {
    fn discover(&self, _root: &Path) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_discovers_conventional_layout_and_rest_of_tree() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(root, "tests/test_api.py");
        touch(root, "tests/unit/test_model.py");
        touch(root, "tests/integration/db_test.py");
        touch(root, "test/tests.py");
        touch(root, "testing/test_slow.py");
        touch(root, "test_root.py");
        touch(root, "tests/helpers.py");
        touch(root, "src/pkg/test_nested.py");
        touch(root, "src/pkg/module.py");

        let found = PatternDiscovery::default().discover(root);
        assert_eq!(
            found,
            vec![
                "src/pkg/test_nested.py",
                "test/tests.py",
                "test_root.py",
                "testing/test_slow.py",
                "tests/integration/db_test.py",
                "tests/test_api.py",
                "tests/unit/test_model.py",
            ]
        );
    }

    #[test]
    fn test_skips_hidden_directories() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "tests/.cache/test_cached.py");
        touch(temp.path(), "tests/test_real.py");
        assert_eq!(PatternDiscovery::default().discover(temp.path()), vec!["tests/test_real.py"]);
    }

    #[test]
    fn test_empty_project() {
        let temp = TempDir::new().unwrap();
        assert!(PatternDiscovery::default().discover(temp.path()).is_empty());
        assert!(NoDiscovery.discover(temp.path()).is_empty());
    }

    #[test]
    fn test_custom_patterns_drop_invalid() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "spec/widget_spec.rb");
        let discovery = PatternDiscovery::new(["*_spec.rb", "[invalid"], ["spec"]);
        assert_eq!(discovery.discover(temp.path()), vec!["spec/widget_spec.rb"]);
    }
}
