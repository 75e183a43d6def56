//! Reference-counted cache of loaded bundles.
//!
//! ```text
//!                    ┌──────────── BundleCache ────────────┐
//!  load(name) ──────►│ permanent   name → handle            │
//!                    │ cache       name → (handle, refs)    │──► BundleLoader
//!  unload(name) ────►│ loading     names in flight          │
//!                    └──────────────────────────────────────┘
//!                                     │ locate(name)
//!                                     ▼
//!                                BundleLocator
//! ```
//!
//! A name is in at most one pool. Permanent bundles are never reference
//! counted and are only released by [`BundleCache::shutdown`].

mod cache;
mod loader;
mod locator;

pub use cache::{AsyncLoad, BundleCache, CacheState};
pub use loader::{BundleLoader, FileBundleLoader, LoadedBundle};
pub use locator::{BundleLocator, LayeredLocator, PersistentLocator};

use thiserror::Error;

use crate::manifest::ManifestError;

/// Bundle cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No manifest entry or no file for the bundle.
    #[error("bundle {name} not found")]
    BundleNotFound { name: String },

    /// A dependency of the bundle has no file on disk.
    #[error("bundle {name} depends on {dependency}, which is missing")]
    DependencyMissing { name: String, dependency: String },

    /// The loader rejected the bundle.
    #[error("failed to load bundle {name}: {reason}")]
    Load { name: String, reason: String },

    /// The cache has not been launched.
    #[error("bundle cache is not ready")]
    NotReady,

    /// The cache is launching or has loads in flight.
    #[error("bundle cache is busy")]
    Busy,

    /// The live manifests could not be read.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Something that can be reloaded after an update installs new manifests.
///
/// The update pipeline holds this instead of a concrete cache so it does not
/// depend on the loader type.
pub trait Relaunch: Send + Sync {
    /// Shut down and launch again from the live manifests.
    fn relaunch(&self) -> Result<(), CacheError>;
}
