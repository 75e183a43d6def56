//! A transfer slot: one worker thread pulling bundles off the shared stack.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use super::checksum::{verify_checksum, ChecksumError};
use super::state::PendingBundle;
use super::Shared;
use crate::codec::{Codec, CodecError};
use crate::error::{is_disk_full, ErrorCode};
use crate::transfer::{join_url, Transport};

/// Why a single bundle could not be installed.
#[derive(Debug, Error)]
pub(crate) enum SlotError {
    #[error(transparent)]
    Transfer(#[from] crate::transfer::TransferError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error("failed to remove {}: {source}", path.display())]
    Cleanup { path: PathBuf, source: io::Error },
}

impl SlotError {
    /// Error code for the batch, or `None` when the slot was interrupted by an
    /// abort instead of failing by itself.
    pub(crate) fn code(&self) -> Option<ErrorCode> {
        match self {
            SlotError::Transfer(e) if e.is_aborted() => None,
            SlotError::Transfer(e) => Some(ErrorCode::from_transfer(e)),
            SlotError::Codec(e) if e.is_disk_full() => Some(ErrorCode::DiskFull),
            SlotError::Cleanup { source, .. } if is_disk_full(source) => Some(ErrorCode::DiskFull),
            _ => Some(ErrorCode::DownloadFailed),
        }
    }
}

/// Everything a slot needs besides the shared state.
pub(crate) struct SlotContext {
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn Codec>,
    pub root_dir: PathBuf,
    pub base_url: String,
}

/// Worker loop: take, transfer, record, repeat until the stack is empty or the
/// batch stops accepting work.
pub(crate) fn run(id: usize, ctx: Arc<SlotContext>, shared: Arc<Shared>) {
    loop {
        let Some(bundle) = shared.state.lock().take_next() else {
            break;
        };

        tracing::debug!(slot = id, bundle = %bundle.name, "Downloading bundle");
        let result = install(&ctx, &shared, &bundle);

        let mut state = shared.state.lock();
        match result {
            Ok(()) => {
                tracing::debug!(slot = id, bundle = %bundle.name, "Bundle installed");
                state.record_success(&bundle.name);
            }
            Err(e) => {
                let code = e.code();
                if code.is_some() {
                    tracing::warn!(slot = id, bundle = %bundle.name, error = %e, "Bundle download failed");
                    // Fail fast: stop every other slot at its next chunk.
                    shared.control.abort();
                } else {
                    tracing::debug!(slot = id, bundle = %bundle.name, "Bundle download interrupted");
                }
                state.record_failure(&bundle.name, code, e.to_string());
            }
        }
    }
}

fn install(ctx: &SlotContext, shared: &Shared, bundle: &PendingBundle) -> Result<(), SlotError> {
    let url = join_url(&ctx.base_url, &bundle.remote_name);
    let dest = ctx.root_dir.join(&bundle.remote_name);

    ctx.transport.fetch(&url, &dest, &shared.control, &mut |delta| {
        shared.completed_size.fetch_add(delta, Ordering::Relaxed);
    })?;

    let installed = if bundle.compressed {
        let plain = ctx.codec.decompress(&dest)?;
        remove(&dest)?;
        plain
    } else {
        dest
    };

    if let Some(expected) = &bundle.checksum {
        if let Err(e) = verify_checksum(&installed, expected) {
            fs::remove_file(&installed).ok();
            return Err(e.into());
        }
    }
    Ok(())
}

fn remove(path: &Path) -> Result<(), SlotError> {
    fs::remove_file(path).map_err(|e| SlotError::Cleanup {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferError;

    #[test]
    fn test_transfer_errors_map_like_the_pipeline() {
        let timeout = SlotError::from(TransferError::Timeout {
            url: "http://cdn/a".to_string(),
            timeout_secs: 300,
        });
        assert_eq!(timeout.code(), Some(ErrorCode::ServerNoResponse));

        let full = SlotError::from(TransferError::DiskFull {
            path: PathBuf::from("/tmp/a"),
        });
        assert_eq!(full.code(), Some(ErrorCode::DiskFull));

        let aborted = SlotError::from(TransferError::Aborted {
            url: "http://cdn/a".to_string(),
        });
        assert_eq!(aborted.code(), None);
    }

    #[test]
    fn test_cleanup_disk_full() {
        let err = SlotError::Cleanup {
            path: PathBuf::from("/tmp/a.gz"),
            source: io::Error::new(io::ErrorKind::StorageFull, "no space"),
        };
        assert_eq!(err.code(), Some(ErrorCode::DiskFull));
    }
}
