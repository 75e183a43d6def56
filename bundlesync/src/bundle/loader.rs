//! Turning bundle files into in-memory handles.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::CacheError;

/// Loads and releases bundles for the cache.
///
/// The cache is the only caller of `release`, and calls it exactly once per
/// successful `load`.
pub trait BundleLoader: Send + Sync + 'static {
    /// Opaque loaded bundle.
    type Handle: Clone + Send + Sync + 'static;

    /// Load the bundle `name` from `path`.
    fn load(&self, name: &str, path: &Path) -> Result<Self::Handle, CacheError>;

    /// Free a handle previously returned by [`BundleLoader::load`].
    fn release(&self, name: &str, handle: Self::Handle);
}

/// A bundle read fully into memory.
#[derive(Debug, Clone)]
pub struct LoadedBundle {
    pub name: String,
    pub path: PathBuf,
    pub bytes: Arc<[u8]>,
}

/// Loader that reads the bundle file into memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBundleLoader;

impl FileBundleLoader {
    pub fn new() -> Self {
        Self
    }
}

impl BundleLoader for FileBundleLoader {
    type Handle = LoadedBundle;

    fn load(&self, name: &str, path: &Path) -> Result<LoadedBundle, CacheError> {
        let bytes = fs::read(path).map_err(|e| CacheError::Load {
            name: name.to_string(),
            reason: format!("{}: {}", path.display(), e),
        })?;
        tracing::trace!(bundle = name, bytes = bytes.len(), "Read bundle");
        Ok(LoadedBundle {
            name: name.to_string(),
            path: path.to_path_buf(),
            bytes: bytes.into(),
        })
    }

    fn release(&self, name: &str, _handle: LoadedBundle) {
        tracing::trace!(bundle = name, "Released bundle");
    }
}
