//! Standard filesystem paths for Cinder.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default root directory for Cinder data.
pub const DEFAULT_ROOT: &str = "/var/lib/cinder";

/// Standard paths used by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CinderPaths {
    /// Root data directory (default: /var/lib/cinder).
    pub root: PathBuf,
}

impl CinderPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding cached template artifacts.
    #[must_use]
    pub fn templates(&self) -> PathBuf {
        self.root.join("template")
    }

    /// Directory for per-sandbox data.
    #[must_use]
    pub fn sandboxes(&self) -> PathBuf {
        self.root.join("sandbox")
    }

    /// Directory for a specific sandbox.
    #[must_use]
    pub fn sandbox(&self, id: &str) -> PathBuf {
        self.sandboxes().join(id)
    }

    /// Private copy-on-write delta of a sandbox's root filesystem.
    #[must_use]
    pub fn sandbox_rootfs_overlay(&self, id: &str) -> PathBuf {
        self.sandbox(id).join("rootfs.ext4.cow")
    }

    /// Create the top-level directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.templates())?;
        std::fs::create_dir_all(self.sandboxes())?;
        Ok(())
    }
}

impl Default for CinderPaths {
    fn default() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        let paths = CinderPaths::new();
        assert_eq!(paths.templates(), PathBuf::from("/var/lib/cinder/template"));
        assert_eq!(
            paths.sandbox("abc123"),
            PathBuf::from("/var/lib/cinder/sandbox/abc123")
        );
    }

    #[test]
    fn custom_root() {
        let paths = CinderPaths::with_root("/tmp/cinder-test");
        assert_eq!(
            paths.sandbox_rootfs_overlay("sbx"),
            PathBuf::from("/tmp/cinder-test/sandbox/sbx/rootfs.ext4.cow")
        );
    }

    #[test]
    fn create_dirs_builds_tree() {
        let temp = tempfile::tempdir().unwrap();
        let paths = CinderPaths::with_root(temp.path().join("root"));
        paths.create_dirs().unwrap();
        assert!(paths.templates().is_dir());
        assert!(paths.sandboxes().is_dir());
    }
}
