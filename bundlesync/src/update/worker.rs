//! Background work for the stages that block on the network.
//!
//! The state machine spawns a [`Task`] and polls `is_finished` every tick, so
//! the scheduling thread never waits on a probe or a transfer.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ConfigFileSpec;
use crate::error::ErrorCode;
use crate::transfer::{join_url, FetchControl, TransferError, Transport};

/// A value being computed on a worker thread.
pub(crate) struct Task<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Task<T> {
    pub(crate) fn spawn<F>(name: &str, job: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("bundlesync-{}", name))
            .spawn(job)?;
        Ok(Self { handle })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Collect the result. `None` if the worker panicked.
    pub(crate) fn join(self) -> Option<T> {
        self.handle.join().ok()
    }
}

/// Probe candidate base URLs in order; the first that answers wins.
pub(crate) fn probe_urls(
    transport: Arc<dyn Transport>,
    urls: Vec<String>,
    timeout: Duration,
) -> Option<String> {
    for url in urls {
        if transport.probe(&url, timeout) {
            tracing::info!(url = %url, "Selected update server");
            return Some(url);
        }
        tracing::warn!(url = %url, "Update server did not answer");
    }
    None
}

/// Failure of the config stage.
#[derive(Debug)]
pub(crate) struct StageFailure {
    pub code: ErrorCode,
    pub message: String,
}

/// Inputs of the config download job.
pub(crate) struct ConfigJob {
    pub transport: Arc<dyn Transport>,
    pub control: FetchControl,
    pub base_url: String,
    pub cache_dir: PathBuf,
    pub files: Vec<ConfigFileSpec>,
    pub finished: Arc<AtomicUsize>,
}

/// What the config stage fetched.
#[derive(Debug, Default)]
pub(crate) struct ConfigOutcome {
    /// Names now present in the scratch cache.
    pub fetched: Vec<String>,
    /// Set when the job stopped because of an abort.
    pub aborted: bool,
}

/// Fetch each config file into the scratch cache.
///
/// A required file's failure is fatal. An optional file's failure is
/// tolerated unless the disk is full.
pub(crate) fn download_configs(job: ConfigJob) -> Result<ConfigOutcome, StageFailure> {
    let mut outcome = ConfigOutcome::default();

    for spec in &job.files {
        let url = join_url(&job.base_url, &spec.name);
        let dest = job.cache_dir.join(&spec.name);

        // Scratch copies from an earlier attempt may be stale; always refetch.
        if let Err(e) = fs::remove_file(&dest) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %dest.display(), error = %e, "Failed to clear scratch file");
            }
        }

        match job.transport.fetch(&url, &dest, &job.control, &mut |_| {}) {
            Ok(size) => {
                tracing::debug!(file = %spec.name, size, "Fetched config file");
                outcome.fetched.push(spec.name.clone());
            }
            Err(TransferError::Aborted { .. }) => {
                outcome.aborted = true;
                return Ok(outcome);
            }
            Err(e) if e.is_disk_full() || spec.required => {
                return Err(StageFailure {
                    code: ErrorCode::from_transfer(&e),
                    message: format!("{}: {}", spec.name, e),
                });
            }
            Err(e) => {
                tracing::warn!(file = %spec.name, error = %e, "Skipping optional config file");
            }
        }
        job.finished.fetch_add(1, Ordering::Relaxed);
    }

    Ok(outcome)
}
