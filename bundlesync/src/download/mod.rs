//! Concurrent bundle downloader.
//!
//! The downloader owns a fixed number of transfer slots. Each slot is a worker
//! thread that pops the next bundle off a LIFO stack, fetches it through the
//! [`Transport`], decompresses compressed artifacts, verifies the checksum when
//! the manifest has one, and refills itself until the stack is empty.
//!
//! ```text
//!            ┌──────── Mutex<DownloadState> ────────┐
//!  start() ─►│ uncomplete: [a, b, c, d, e]  ◄─ pop  │◄── slot 0
//!            │ downloading: {e, d}                  │◄── slot 1
//!            │ complete / failed / error_code       │
//!            └──────────────────────────────────────┘
//!  poll: is_done(), progress()
//! ```
//!
//! The first failure sets the error code and aborts every other in-flight
//! transfer (fail fast). The polling thread never blocks on workers.

mod checksum;
mod slot;
mod state;

pub use checksum::{calculate_file_checksum, verify_checksum, ChecksumError};
pub use state::{DownloadState, PendingBundle};

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::codec::Codec;
use crate::error::ErrorCode;
use crate::manifest::{is_safe_bundle_name, ResourcesManifest};
use crate::transfer::{FetchControl, Transport};
use slot::SlotContext;

/// Default number of concurrent transfer slots.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// State shared between the owner and its slots.
pub(crate) struct Shared {
    pub(crate) state: Mutex<DownloadState>,
    pub(crate) control: FetchControl,
    pub(crate) completed_size: AtomicU64,
}

impl Shared {
    fn new(state: DownloadState) -> Self {
        Self {
            state: Mutex::new(state),
            control: FetchControl::new(),
            completed_size: AtomicU64::new(0),
        }
    }

    fn rejected(code: ErrorCode, message: String) -> Self {
        let mut state = DownloadState::default();
        state.error_code = Some(code);
        state.last_error = Some(message);
        Self::new(state)
    }
}

/// Downloads a batch of bundles into a root directory.
///
/// # Example
///
/// ```ignore
/// let mut downloader = Downloader::new(transport, codec).with_concurrency(4);
/// if downloader.start(root, "https://cdn.example.com/v2", &names, &resources) {
///     while !downloader.is_done() {
///         render(downloader.progress());
///     }
/// }
/// ```
pub struct Downloader {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    concurrency: usize,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Downloader {
    /// Create an idle downloader.
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn Codec>) -> Self {
        Self {
            transport,
            codec,
            concurrency: DEFAULT_CONCURRENCY,
            shared: Arc::new(Shared::new(DownloadState::default())),
            workers: Vec::new(),
        }
    }

    /// Set the number of transfer slots (at least one).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Number of transfer slots.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start downloading `names` into `root_dir` from `base_url`.
    ///
    /// Names are stacked in iteration order and taken from the end. Returns
    /// `false` without spawning anything when a batch is still running, when
    /// the arguments are invalid (error code set), or when there is nothing
    /// to download.
    pub fn start<I, S>(
        &mut self,
        root_dir: &Path,
        base_url: &str,
        names: I,
        resources: &ResourcesManifest,
    ) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.is_running() {
            tracing::warn!("Downloader already running");
            return false;
        }
        self.join();

        if root_dir.as_os_str().is_empty() || base_url.trim().is_empty() {
            self.shared = Arc::new(Shared::rejected(
                ErrorCode::ParameterError,
                "empty root directory or base URL".to_string(),
            ));
            return false;
        }

        let mut bundles = Vec::new();
        for name in names {
            let name = name.as_ref();
            if !is_safe_bundle_name(name) {
                tracing::warn!(bundle = name, "Refusing bundle name outside the root directory");
                self.shared = Arc::new(Shared::rejected(
                    ErrorCode::ParameterError,
                    format!("bundle name {:?} escapes the root directory", name),
                ));
                return false;
            }
            let Some(desc) = resources.get(name) else {
                tracing::warn!(bundle = name, "Requested bundle not in manifest");
                self.shared = Arc::new(Shared::rejected(
                    ErrorCode::BundleNotFound,
                    format!("bundle {} is not described by the manifest", name),
                ));
                return false;
            };
            bundles.push(PendingBundle::from_descriptor(desc, |n| {
                self.codec.compressed_name(n)
            }));
        }

        self.shared = Arc::new(Shared::new(DownloadState::new(bundles)));
        let count = self.shared.state.lock().uncomplete.len();
        if count == 0 {
            return false;
        }

        let ctx = Arc::new(SlotContext {
            transport: Arc::clone(&self.transport),
            codec: Arc::clone(&self.codec),
            root_dir: root_dir.to_path_buf(),
            base_url: base_url.to_string(),
        });

        let slots = self.concurrency.min(count);
        tracing::info!(
            bundles = count,
            slots,
            total_bytes = self.total_size(),
            "Starting bundle download"
        );

        for id in 0..slots {
            let ctx = Arc::clone(&ctx);
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("bundlesync-slot-{}", id))
                .spawn(move || slot::run(id, ctx, shared));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    tracing::warn!(slot = id, error = %e, "Failed to spawn transfer slot");
                    if self.workers.is_empty() {
                        let mut state = self.shared.state.lock();
                        state.error_code = Some(ErrorCode::DownloadFailed);
                        state.last_error = Some(e.to_string());
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Whether the batch reached a terminal condition: everything done, an
    /// error, a drained cancel, or an abort.
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().is_done()
    }

    /// Whether the batch failed.
    pub fn is_failed(&self) -> bool {
        self.error_code().is_some()
    }

    /// Whether every requested bundle was installed.
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().is_complete()
    }

    /// First error of the batch.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.shared.state.lock().error_code
    }

    /// Description of the first error of the batch.
    pub fn last_error(&self) -> Option<String> {
        self.shared.state.lock().last_error.clone()
    }

    /// Let in-flight transfers finish, then stop.
    pub fn cancel(&self) {
        tracing::info!("Cancelling bundle download");
        self.shared.state.lock().cancel_requested = true;
    }

    /// Stop in-flight transfers at their next chunk. Partial files stay on
    /// disk for the next attempt to resume.
    pub fn abort(&self) {
        tracing::info!("Aborting bundle download");
        self.shared.state.lock().abort_requested = true;
        self.shared.control.abort();
    }

    /// Sum of transfer sizes requested at start.
    pub fn total_size(&self) -> u64 {
        self.shared.state.lock().total_size
    }

    /// Bytes reported by the transfer slots so far.
    pub fn completed_size(&self) -> u64 {
        self.shared.completed_size.load(Ordering::Relaxed)
    }

    /// Fraction of bytes transferred, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let total = self.total_size();
        if total == 0 {
            return if self.is_done() { 1.0 } else { 0.0 };
        }
        (self.completed_size() as f64 / total as f64).min(1.0)
    }

    /// Names installed so far, in completion order.
    pub fn complete_names(&self) -> Vec<String> {
        self.shared.state.lock().complete.clone()
    }

    /// Names that failed or were interrupted.
    pub fn failed_names(&self) -> Vec<String> {
        self.shared.state.lock().failed.clone()
    }

    /// Number of bundles not yet taken by a slot.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().uncomplete.len()
    }

    /// Whether any slot thread is still alive.
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|w| !w.is_finished())
    }

    /// Block until every slot thread has exited.
    pub fn join(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Transfer slot panicked");
            }
        }
    }

    /// Abort and stop tracking the slot threads without waiting for them.
    ///
    /// A slot blocked inside a transport read exits once the read returns and
    /// it sees the abort.
    pub fn detach(&mut self) {
        self.abort();
        let detached = self.workers.drain(..).filter(|w| !w.is_finished()).count();
        if detached > 0 {
            tracing::debug!(detached, "Detached transfer slots");
        }
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        if self.is_running() {
            self.detach();
        } else {
            self.join();
        }
    }
}
