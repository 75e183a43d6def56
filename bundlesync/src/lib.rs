//! bundlesync - incremental asset bundle synchronization
//!
//! This library keeps a local set of asset bundles in step with a remote
//! release. It diffs two manifest versions, downloads only what changed with
//! resumable transfers, installs the new manifests and serves bundles to the
//! host through a reference-counted cache.
//!
//! ```text
//! UpdateStateMachine ──► DifferenceCalculator ──► Downloader ──► Transport
//!         │                                                        │
//!         └── Relaunch ──► BundleCache ──► BundleLoader       http / dir
//! ```

pub mod bundle;
pub mod codec;
pub mod config;
pub mod diff;
pub mod download;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod manifest;
pub mod transfer;
pub mod update;
pub mod version;

pub use bundle::{BundleCache, CacheError, CacheState, Relaunch};
pub use config::{ConfigFile, SyncConfig};
pub use diff::{BundleDiff, DiffMode, DifferenceCalculator};
pub use download::Downloader;
pub use error::{ErrorCode, ManifestSide, SyncError};
pub use manifest::{ManifestPaths, ManifestStore};
pub use update::{UpdateHandle, UpdateState, UpdateStateMachine, UpdateStatus};
pub use version::ManifestVersion;
