//! Transfer contract consumed by the downloader and the update pipeline.
//!
//! The pipeline never talks to a network stack directly. It needs two things
//! from a transport:
//!
//! - `probe`: a HEAD-style reachability check with a timeout and no redirects
//! - `fetch`: copy a remote file to a local path, resuming a previous partial
//!   copy when possible, reporting progress as byte deltas and stopping early
//!   when the shared [`FetchControl`] is aborted
//!
//! Two implementations are provided:
//!
//! ```text
//! Transport (trait)
//!     ├── HttpTransport       reqwest blocking client, Range/If-Range resume
//!     └── DirectoryTransport  file:// or plain-path mirrors
//! ```

mod directory;
mod http;

pub use directory::DirectoryTransport;
pub use http::HttpTransport;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::error::is_disk_full;

/// Progress sink: receives the number of bytes written since the last call.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64);

/// Errors reported by a transport.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The local disk is full.
    #[error("disk full while writing {}", path.display())]
    DiskFull { path: PathBuf },

    /// The transfer was aborted through its [`FetchControl`].
    #[error("transfer of {url} aborted")]
    Aborted { url: String },

    /// The server answered with an error or the connection failed.
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    /// The request timed out.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// A local filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

impl TransferError {
    /// Classify a local I/O failure, separating out a full disk.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        if is_disk_full(&source) {
            TransferError::DiskFull {
                path: path.to_path_buf(),
            }
        } else {
            TransferError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Whether the disk is full.
    pub fn is_disk_full(&self) -> bool {
        matches!(self, TransferError::DiskFull { .. })
    }

    /// Whether the transfer stopped because it was aborted.
    pub fn is_aborted(&self) -> bool {
        matches!(self, TransferError::Aborted { .. })
    }
}

/// Shared stop signal for in-flight transfers.
///
/// Cloning shares the flag. Transports check it between chunks.
#[derive(Debug, Clone, Default)]
pub struct FetchControl {
    aborted: Arc<AtomicBool>,
}

impl FetchControl {
    /// Create a control that has not been aborted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop all transfers sharing this control at their next chunk boundary.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Whether abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// A source of remote files.
pub trait Transport: Send + Sync {
    /// Whether `url` answers a HEAD-style request within `timeout`.
    fn probe(&self, url: &str, timeout: Duration) -> bool;

    /// Copy `url` to `dest`, returning the final size of `dest`.
    ///
    /// Implementations resume a partial `dest` when they can, call
    /// `on_progress` with byte deltas, and return
    /// [`TransferError::Aborted`] once `control` is aborted.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        control: &FetchControl,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, TransferError>;
}

/// Join a base URL and a relative file name with exactly one slash.
pub fn join_url(base: &str, name: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://cdn/v1", "a.bin"), "http://cdn/v1/a.bin");
        assert_eq!(join_url("http://cdn/v1/", "/a.bin"), "http://cdn/v1/a.bin");
    }

    #[test]
    fn test_fetch_control_shared() {
        let control = FetchControl::new();
        let clone = control.clone();
        assert!(!clone.is_aborted());
        control.abort();
        assert!(clone.is_aborted());
    }

    #[test]
    fn test_from_io_classifies_disk_full() {
        let err = TransferError::from_io(
            Path::new("/x"),
            io::Error::new(io::ErrorKind::StorageFull, "full"),
        );
        assert!(err.is_disk_full());

        let err = TransferError::from_io(
            Path::new("/x"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_disk_full());
    }
}
