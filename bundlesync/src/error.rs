//! Error taxonomy for the synchronization pipeline.
//!
//! Component boundaries have their own error enums (manifest parsing,
//! transfers, codec, bundle cache). The update pipeline collapses all of them
//! into a single [`ErrorCode`] which, together with the terminal state, is the
//! source of truth for callers.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::bundle::CacheError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::manifest::ManifestError;
use crate::transfer::TransferError;

/// Which side of a manifest pair failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestSide {
    /// The live manifest currently installed under the root directory.
    Old,
    /// The freshly downloaded manifest in the scratch cache.
    New,
}

impl fmt::Display for ManifestSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestSide::Old => write!(f, "old"),
            ManifestSide::New => write!(f, "new"),
        }
    }
}

/// Error kinds reported by the downloader and the update pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A caller supplied invalid arguments.
    ParameterError,
    /// An operation did not finish in time.
    Timeout,
    /// Local preconditions for the update were not met.
    PreprocessError,
    /// A manifest could not be loaded or parsed.
    ManifestLoadFailed(ManifestSide),
    /// A requested bundle is not described by the manifest.
    BundleNotFound,
    /// None of the candidate base URLs answered.
    InvalidUrl,
    /// The server accepted the connection but never answered.
    ServerNoResponse,
    /// A transfer failed.
    DownloadFailed,
    /// The local disk ran out of space.
    DiskFull,
    /// Replacing a live file failed.
    WriteException,
}

impl ErrorCode {
    /// Whether this error must never be retried.
    ///
    /// Running out of disk space aborts the whole pipeline and discards the
    /// live config files so the next launch re-bootstraps from the install
    /// package.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCode::DiskFull)
    }

    /// Translate a transfer error into the pipeline taxonomy.
    pub fn from_transfer(err: &TransferError) -> Self {
        match err {
            TransferError::DiskFull { .. } => ErrorCode::DiskFull,
            TransferError::Timeout { .. } => ErrorCode::ServerNoResponse,
            _ => ErrorCode::DownloadFailed,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ParameterError => write!(f, "parameter error"),
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::PreprocessError => write!(f, "preprocess error"),
            ErrorCode::ManifestLoadFailed(side) => {
                write!(f, "failed to load {} manifest", side)
            }
            ErrorCode::BundleNotFound => write!(f, "bundle not found"),
            ErrorCode::InvalidUrl => write!(f, "no valid server URL"),
            ErrorCode::ServerNoResponse => write!(f, "server did not respond"),
            ErrorCode::DownloadFailed => write!(f, "download failed"),
            ErrorCode::DiskFull => write!(f, "disk full"),
            ErrorCode::WriteException => write!(f, "failed to write live file"),
        }
    }
}

/// Host-facing error for operations outside the polled pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Manifest load or save failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// A transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Compression or decompression failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Bundle cache operation failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The update pipeline finished unsuccessfully.
    #[error("update failed: {0}")]
    Update(ErrorCode),

    /// Filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Whether an I/O error means the disk is out of space.
pub fn is_disk_full(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::StorageFull {
        return true;
    }

    #[cfg(unix)]
    {
        // ENOSPC
        matches!(err.raw_os_error(), Some(28))
    }
    #[cfg(windows)]
    {
        // ERROR_DISK_FULL, ERROR_HANDLE_DISK_FULL
        matches!(err.raw_os_error(), Some(112) | Some(39))
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::DiskFull.to_string(), "disk full");
        assert_eq!(
            ErrorCode::ManifestLoadFailed(ManifestSide::New).to_string(),
            "failed to load new manifest"
        );
    }

    #[test]
    fn test_only_disk_full_is_fatal() {
        assert!(ErrorCode::DiskFull.is_fatal());
        assert!(!ErrorCode::DownloadFailed.is_fatal());
        assert!(!ErrorCode::InvalidUrl.is_fatal());
    }

    #[test]
    fn test_from_transfer() {
        let full = TransferError::DiskFull {
            path: PathBuf::from("/tmp/a"),
        };
        assert_eq!(ErrorCode::from_transfer(&full), ErrorCode::DiskFull);

        let http = TransferError::Http {
            url: "http://x/a".to_string(),
            reason: "404".to_string(),
        };
        assert_eq!(ErrorCode::from_transfer(&http), ErrorCode::DownloadFailed);
    }

    #[test]
    fn test_is_disk_full_kind() {
        let err = io::Error::new(io::ErrorKind::StorageFull, "no space");
        assert!(is_disk_full(&err));

        let err = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert!(!is_disk_full(&err));
    }

    #[cfg(unix)]
    #[test]
    fn test_is_disk_full_enospc() {
        let err = io::Error::from_raw_os_error(28);
        assert!(is_disk_full(&err));
    }
}
