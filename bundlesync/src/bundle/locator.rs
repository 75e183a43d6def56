//! Where bundle files are looked up.
//!
//! The lookup order is a strategy object handed to the cache instead of a
//! process-wide setting, so two caches can use different layouts side by side.

use std::path::PathBuf;

/// Resolves a bundle name to a file on disk.
pub trait BundleLocator: Send + Sync {
    /// Path of the bundle file, or `None` when no copy exists.
    fn locate(&self, name: &str) -> Option<PathBuf>;
}

/// Only the persistent (downloaded) root.
#[derive(Debug, Clone)]
pub struct PersistentLocator {
    root: PathBuf,
}

impl PersistentLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BundleLocator for PersistentLocator {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        let path = self.root.join(name);
        path.is_file().then_some(path)
    }
}

/// The persistent root first, then the read-only install package.
///
/// Downloaded copies shadow the ones shipped with the install package.
#[derive(Debug, Clone)]
pub struct LayeredLocator {
    persistent: PathBuf,
    install: PathBuf,
}

impl LayeredLocator {
    pub fn new(persistent: impl Into<PathBuf>, install: impl Into<PathBuf>) -> Self {
        Self {
            persistent: persistent.into(),
            install: install.into(),
        }
    }
}

impl BundleLocator for LayeredLocator {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        [&self.persistent, &self.install]
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_persistent_locator() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("a"), b"x").unwrap();

        let locator = PersistentLocator::new(root.path());
        assert_eq!(locator.locate("a"), Some(root.path().join("a")));
        assert_eq!(locator.locate("b"), None);
    }

    #[test]
    fn test_layered_locator_prefers_persistent() {
        let persistent = TempDir::new().unwrap();
        let install = TempDir::new().unwrap();
        fs::write(persistent.path().join("a"), b"new").unwrap();
        fs::write(install.path().join("a"), b"old").unwrap();
        fs::write(install.path().join("b"), b"native").unwrap();

        let locator = LayeredLocator::new(persistent.path(), install.path());
        assert_eq!(locator.locate("a"), Some(persistent.path().join("a")));
        assert_eq!(locator.locate("b"), Some(install.path().join("b")));
        assert_eq!(locator.locate("c"), None);
    }
}
