//! Manifest data model and persistence.
//!
//! Two manifests describe an installed bundle set:
//!
//! - **Dependency graph** (binary): bundle → content hash and direct dependencies.
//! - **Resources manifest** (JSON): version token plus one descriptor per bundle
//!   with assets, scenes, sizes and installation flags.
//!
//! [`ManifestStore`] owns one of each and answers the lookups the rest of the
//! crate needs.

mod descriptor;
mod graph;
mod resources;
mod store;

pub use descriptor::{BundleDescriptor, BundleFlags};
pub use graph::{DependencyGraph, GraphEntry};
pub use resources::ResourcesManifest;
pub use store::{ManifestPaths, ManifestStore, DEFAULT_GRAPH_FILE, DEFAULT_RESOURCES_FILE};

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::error::is_disk_full;

/// Whether `name` stays inside the directory it is joined to.
///
/// Bundle names come from remote manifests and end up in `root.join(name)`
/// for writes and deletes, so only relative paths made of normal components
/// are accepted.
pub fn is_safe_bundle_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Why a manifest write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailureKind {
    /// The disk is out of space.
    DiskFull,
    /// Any other I/O failure.
    Io,
}

/// Errors from loading or saving manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file does not exist.
    #[error("manifest not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The file exists but could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    /// The file content is malformed.
    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    /// Encoding the manifest failed.
    #[error("failed to encode manifest: {0}")]
    Encode(String),

    /// Writing the manifest failed.
    #[error("failed to write {} ({kind:?}): {source}", path.display())]
    Write {
        path: PathBuf,
        kind: WriteFailureKind,
        source: io::Error,
    },
}

impl ManifestError {
    /// Whether the file was simply absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ManifestError::NotFound { .. })
    }

    /// Whether a write failed because the disk is full.
    pub fn is_disk_full(&self) -> bool {
        matches!(
            self,
            ManifestError::Write {
                kind: WriteFailureKind::DiskFull,
                ..
            }
        )
    }
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>, ManifestError> {
    fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ManifestError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ManifestError::Read {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })
}

/// Write through a sibling `.tmp` file so readers never see a partial file.
pub(crate) fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ManifestError> {
    let to_error = |e: io::Error| ManifestError::Write {
        path: path.to_path_buf(),
        kind: if is_disk_full(&e) {
            WriteFailureKind::DiskFull
        } else {
            WriteFailureKind::Io
        },
        source: e,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(to_error)?;
        }
    }

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if let Err(e) = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, path)) {
        fs::remove_file(&tmp).ok();
        return Err(to_error(e));
    }
    Ok(())
}
