//! The poll-driven update pipeline.

use std::fs;
use std::mem;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::install;
use super::state::UpdateState;
use super::worker::{self, ConfigJob, ConfigOutcome, StageFailure, Task};
use crate::bundle::Relaunch;
use crate::codec::Codec;
use crate::config::SyncConfig;
use crate::diff::{DiffMode, DifferenceCalculator};
use crate::download::Downloader;
use crate::error::{is_disk_full, ErrorCode, ManifestSide};
use crate::ledger::DownloadLedger;
use crate::manifest::ManifestStore;
use crate::transfer::{FetchControl, Transport};

/// Snapshot of the pipeline, returned by [`UpdateStateMachine::poll`] and
/// passed to observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateStatus {
    pub state: UpdateState,
    /// Overall progress in `[0, 1]`.
    pub progress: f64,
    pub error_code: Option<ErrorCode>,
}

impl UpdateStatus {
    /// Whether the pipeline reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Observer callback.
pub type Observer = Box<dyn FnMut(&UpdateStatus) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum StopRequest {
    None = 0,
    Cancel = 1,
    Abort = 2,
}

/// Thread-safe handle for stopping a running update, e.g. from a signal
/// handler.
#[derive(Debug, Clone, Default)]
pub struct UpdateHandle {
    stop: Arc<AtomicU8>,
}

impl UpdateHandle {
    /// Stop once in-flight transfers finish their current file.
    pub fn cancel(&self) {
        let _ = self.stop.compare_exchange(
            StopRequest::None as u8,
            StopRequest::Cancel as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Stop in-flight transfers at their next chunk.
    pub fn abort(&self) {
        self.stop.store(StopRequest::Abort as u8, Ordering::SeqCst);
    }

    fn request(&self) -> StopRequest {
        match self.stop.load(Ordering::SeqCst) {
            1 => StopRequest::Cancel,
            2 => StopRequest::Abort,
            _ => StopRequest::None,
        }
    }

    fn reset(&self) {
        self.stop.store(StopRequest::None as u8, Ordering::SeqCst);
    }
}

/// Work the current state is waiting on.
enum Pending {
    Idle,
    Probe(Task<Option<String>>),
    Configs {
        task: Task<Result<ConfigOutcome, StageFailure>>,
        finished: Arc<AtomicUsize>,
        total: usize,
    },
    Bundles(Downloader),
}

/// Outcome of one tick of a state.
enum Step {
    Wait,
    Next,
    Fail(ErrorCode, String),
}

/// Downloads, verifies and installs a new manifest version.
///
/// The host calls [`poll`](Self::poll) on its own schedule. Blocking work
/// (URL probes, transfers) runs on worker threads; `poll` only checks whether
/// it finished. Every failure, cancel or abort passes through `Dispose`,
/// which persists the resume ledger, before reaching a terminal state.
///
/// # Example
///
/// ```ignore
/// let mut update = UpdateStateMachine::new(config, transport, codec)
///     .with_bundle_cache(cache)
///     .on_done(|status| println!("update finished: {:?}", status.state));
/// let status = update.run(Duration::from_millis(16));
/// ```
pub struct UpdateStateMachine {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    bundle_cache: Option<Arc<dyn Relaunch>>,
    on_update: Option<Observer>,
    on_done: Option<Observer>,
    handle: UpdateHandle,
    control: FetchControl,

    state: UpdateState,
    local: f64,
    progress: f64,
    error_code: Option<ErrorCode>,
    error_message: Option<String>,
    stopping: StopRequest,
    pending: Pending,
    base_url: Option<String>,
    fetched_configs: Vec<String>,
    new_store: Option<ManifestStore>,
    ledger: DownloadLedger,
    done_fired: bool,
}

impl UpdateStateMachine {
    /// Create a pipeline in the `Initialize` state.
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>, codec: Arc<dyn Codec>) -> Self {
        Self {
            config,
            transport,
            codec,
            bundle_cache: None,
            on_update: None,
            on_done: None,
            handle: UpdateHandle::default(),
            control: FetchControl::new(),
            state: UpdateState::Initialize,
            local: 0.0,
            progress: 0.0,
            error_code: None,
            error_message: None,
            stopping: StopRequest::None,
            pending: Pending::Idle,
            base_url: None,
            fetched_configs: Vec::new(),
            new_store: None,
            ledger: DownloadLedger::new(),
            done_fired: false,
        }
    }

    /// Relaunch this cache after a successful update.
    pub fn with_bundle_cache(mut self, cache: Arc<dyn Relaunch>) -> Self {
        self.bundle_cache = Some(cache);
        self
    }

    /// Called on every state transition.
    pub fn on_update<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&UpdateStatus) + Send + 'static,
    {
        self.on_update = Some(Box::new(observer));
        self
    }

    /// Called once per run when a terminal state is reached.
    pub fn on_done<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&UpdateStatus) + Send + 'static,
    {
        self.on_done = Some(Box::new(observer));
        self
    }

    /// Handle for cancelling or aborting from another thread.
    pub fn handle(&self) -> UpdateHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    /// Details of the first error.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Base URL chosen by `VerifyUrl`.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        self.state == UpdateState::Failed
    }

    pub fn status(&self) -> UpdateStatus {
        UpdateStatus {
            state: self.state,
            progress: self.progress,
            error_code: self.error_code,
        }
    }

    /// Request a graceful stop.
    pub fn cancel(&mut self) {
        self.handle.cancel();
        self.observe_stop();
    }

    /// Request an immediate stop.
    pub fn abort(&mut self) {
        self.handle.abort();
        self.observe_stop();
    }

    /// Start over from `Initialize`. Only allowed from a terminal state that
    /// did not end in a fatal error.
    ///
    /// Bundles fetched by the previous run are skipped through the resume
    /// ledger.
    pub fn restart(&mut self) -> bool {
        if !self.state.is_terminal() {
            return false;
        }
        if let Some(code) = self.error_code.filter(ErrorCode::is_fatal) {
            tracing::warn!(error = %code, "Not restarting after a fatal error");
            return false;
        }
        tracing::info!(from = %self.state, "Restarting update");

        self.handle.reset();
        self.control = FetchControl::new();
        self.state = UpdateState::Initialize;
        self.local = 0.0;
        self.progress = 0.0;
        self.error_code = None;
        self.error_message = None;
        self.stopping = StopRequest::None;
        self.pending = Pending::Idle;
        self.base_url = None;
        self.fetched_configs.clear();
        self.new_store = None;
        self.ledger = DownloadLedger::new();
        self.done_fired = false;
        true
    }

    /// Poll until a terminal state, sleeping `tick` between polls.
    pub fn run(&mut self, tick: Duration) -> UpdateStatus {
        loop {
            let status = self.poll();
            if status.is_done() {
                return status;
            }
            thread::sleep(tick);
        }
    }

    /// Advance the pipeline by one tick. Never blocks on network work.
    pub fn poll(&mut self) -> UpdateStatus {
        if self.state.is_terminal() {
            return self.status();
        }

        if self.state != UpdateState::Dispose {
            self.observe_stop();
            if self.stopping != StopRequest::None {
                if !self.settle_for_stop() {
                    return self.status();
                }
                self.enter(UpdateState::Dispose);
            }
        }

        let step = match self.state {
            UpdateState::Initialize => self.initialize(),
            UpdateState::VerifyUrl => self.verify_url(),
            UpdateState::DownloadMainConfig => self.download_main_config(),
            UpdateState::UpdateAssetBundle => self.update_asset_bundle(),
            UpdateState::CopyCacheFile => self.copy_cache_file(),
            UpdateState::Dispose => {
                self.dispose();
                return self.status();
            }
            _ => Step::Wait,
        };

        match step {
            Step::Wait => {
                self.progress = self.config.stage_weights.overall(self.state, self.local);
            }
            Step::Next => {
                if let Some(next) = self.state.next() {
                    self.enter(next);
                }
            }
            Step::Fail(code, message) => self.fail(code, message),
        }
        self.status()
    }

    fn enter(&mut self, state: UpdateState) {
        let from = self.state;
        self.state = state;
        self.local = 0.0;
        if state == UpdateState::Completed {
            self.progress = 1.0;
        } else if !state.is_terminal() {
            self.progress = self.config.stage_weights.overall(state, 0.0);
        }

        tracing::info!(from = %from, to = %state, progress = self.progress, "Update state changed");

        let status = self.status();
        if let Some(observer) = self.on_update.as_mut() {
            observer(&status);
        }
        if state.is_terminal() && !self.done_fired {
            self.done_fired = true;
            if let Some(observer) = self.on_done.as_mut() {
                observer(&status);
            }
        }
    }

    fn fail(&mut self, code: ErrorCode, message: String) {
        if self.error_code.is_none() {
            tracing::warn!(state = %self.state, error = %code, detail = %message, "Update failed");
            self.error_code = Some(code);
            self.error_message = Some(message);
        }
        self.enter(UpdateState::Dispose);
    }

    fn observe_stop(&mut self) {
        let request = self.handle.request();
        // Once in Dispose the outcome is decided.
        if request <= self.stopping || self.state.is_terminal() || self.state == UpdateState::Dispose {
            return;
        }
        tracing::info!(state = %self.state, request = ?request, "Stop requested");
        self.stopping = request;

        match request {
            StopRequest::Abort => {
                self.control.abort();
                if let Pending::Bundles(downloader) = &self.pending {
                    downloader.abort();
                }
            }
            StopRequest::Cancel => {
                if let Pending::Bundles(downloader) = &self.pending {
                    downloader.cancel();
                }
            }
            StopRequest::None => {}
        }
    }

    /// Wind down in-flight work for a stop. Returns `true` once the pipeline
    /// can move to `Dispose`.
    ///
    /// Cancel waits for the current unit of work; abort detaches every
    /// worker, including transfer slots stuck in a read.
    fn settle_for_stop(&mut self) -> bool {
        let abort = self.stopping == StopRequest::Abort;
        match mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => true,
            Pending::Probe(task) if abort || task.is_finished() => true,
            Pending::Configs { task, .. } if abort || task.is_finished() => true,
            Pending::Bundles(mut downloader) if abort => {
                self.record_downloads(&downloader);
                downloader.detach();
                true
            }
            Pending::Bundles(mut downloader)
                if downloader.is_done() && !downloader.is_running() =>
            {
                downloader.join();
                self.record_downloads(&downloader);
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    fn initialize(&mut self) -> Step {
        if let Err(e) = self.config.validate() {
            return Step::Fail(ErrorCode::ParameterError, e.to_string());
        }

        for dir in [self.config.root_dir.clone(), self.config.cache_dir()] {
            if let Err(e) = fs::create_dir_all(&dir) {
                let code = if is_disk_full(&e) {
                    ErrorCode::DiskFull
                } else {
                    ErrorCode::PreprocessError
                };
                return Step::Fail(code, format!("{}: {}", dir.display(), e));
            }
        }

        self.ledger = DownloadLedger::load(&self.config.ledger_path());
        if !self.ledger.is_empty() {
            tracing::info!(entries = self.ledger.len(), "Resuming previous update");
        }
        Step::Next
    }

    fn verify_url(&mut self) -> Step {
        match mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => {
                if self.config.urls.is_empty() {
                    return Step::Fail(ErrorCode::ParameterError, "no candidate URLs".to_string());
                }
                let transport = Arc::clone(&self.transport);
                let urls = self.config.urls.clone();
                let timeout = self.config.probe_timeout;
                match Task::spawn("probe", move || worker::probe_urls(transport, urls, timeout)) {
                    Ok(task) => {
                        self.pending = Pending::Probe(task);
                        Step::Wait
                    }
                    Err(e) => Step::Fail(ErrorCode::PreprocessError, e.to_string()),
                }
            }
            Pending::Probe(task) if task.is_finished() => match task.join() {
                Some(Some(url)) => {
                    self.base_url = Some(url);
                    Step::Next
                }
                Some(None) => Step::Fail(
                    ErrorCode::InvalidUrl,
                    format!("none of {} candidate URLs answered", self.config.urls.len()),
                ),
                None => Step::Fail(ErrorCode::InvalidUrl, "probe worker panicked".to_string()),
            },
            other => {
                self.pending = other;
                Step::Wait
            }
        }
    }

    fn download_main_config(&mut self) -> Step {
        match mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => {
                let Some(base_url) = self.base_url.clone() else {
                    return Step::Fail(ErrorCode::ParameterError, "no base URL".to_string());
                };
                let finished = Arc::new(AtomicUsize::new(0));
                let job = ConfigJob {
                    transport: Arc::clone(&self.transport),
                    control: self.control.clone(),
                    base_url,
                    cache_dir: self.config.cache_dir(),
                    files: self.config.config_files.clone(),
                    finished: Arc::clone(&finished),
                };
                let total = job.files.len();
                match Task::spawn("config", move || worker::download_configs(job)) {
                    Ok(task) => {
                        self.pending = Pending::Configs {
                            task,
                            finished,
                            total,
                        };
                        Step::Wait
                    }
                    Err(e) => Step::Fail(ErrorCode::DownloadFailed, e.to_string()),
                }
            }
            Pending::Configs { task, .. } if task.is_finished() => match task.join() {
                Some(Ok(outcome)) if !outcome.aborted => {
                    tracing::info!(files = outcome.fetched.len(), "Downloaded config files");
                    self.fetched_configs = outcome.fetched;
                    Step::Next
                }
                Some(Ok(_)) => {
                    Step::Fail(ErrorCode::DownloadFailed, "config download interrupted".to_string())
                }
                Some(Err(failure)) => Step::Fail(failure.code, failure.message),
                None => Step::Fail(ErrorCode::DownloadFailed, "config worker panicked".to_string()),
            },
            Pending::Configs {
                task,
                finished,
                total,
            } => {
                if total > 0 {
                    self.local = finished.load(Ordering::Relaxed) as f64 / total as f64;
                }
                self.pending = Pending::Configs {
                    task,
                    finished,
                    total,
                };
                Step::Wait
            }
            other => {
                self.pending = other;
                Step::Wait
            }
        }
    }

    fn update_asset_bundle(&mut self) -> Step {
        match mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => self.start_bundle_download(),
            Pending::Bundles(mut downloader) => {
                if !downloader.is_done() || downloader.is_running() {
                    self.local = downloader.progress();
                    self.pending = Pending::Bundles(downloader);
                    return Step::Wait;
                }
                downloader.join();
                self.record_downloads(&downloader);
                match downloader.error_code() {
                    Some(code) => Step::Fail(code, downloader.last_error().unwrap_or_default()),
                    None => Step::Next,
                }
            }
            other => {
                self.pending = other;
                Step::Wait
            }
        }
    }

    /// Diff the live manifests against the fetched ones, delete obsolete
    /// bundles and start the downloader.
    fn start_bundle_download(&mut self) -> Step {
        let root = self.config.root_dir.clone();
        let paths = self.config.manifest_paths.clone();

        let old = match ManifestStore::load_or_empty(&root, &paths) {
            Ok(store) => store,
            Err(e) => return Step::Fail(ErrorCode::ManifestLoadFailed(ManifestSide::Old), e.to_string()),
        };
        let new = match ManifestStore::load(&self.config.cache_dir(), &paths) {
            Ok(store) => store,
            Err(e) => return Step::Fail(ErrorCode::ManifestLoadFailed(ManifestSide::New), e.to_string()),
        };

        if !self.config.allow_downgrade && !old.version().is_empty() && new.version() < old.version() {
            return Step::Fail(
                ErrorCode::PreprocessError,
                format!(
                    "remote version {} is older than installed version {}",
                    new.version(),
                    old.version()
                ),
            );
        }

        let pruned = self.ledger.prune_against(new.graph());
        let diff = DifferenceCalculator::new(&root).with_ledger(&self.ledger).diff(
            old.graph(),
            new.graph(),
            old.resources(),
            new.resources(),
            DiffMode::All,
        );
        tracing::info!(
            from = %old.version(),
            to = %new.version(),
            download = diff.download.len(),
            delete = diff.delete.len(),
            pruned,
            "Planned bundle update"
        );

        let removed = install::delete_bundles(&root, &diff.delete);
        for name in &diff.delete {
            self.ledger.remove(name);
        }
        if removed > 0 {
            tracing::info!(removed, "Deleted obsolete bundles");
        }

        if diff.download.is_empty() {
            self.new_store = Some(new);
            return Step::Next;
        }

        let Some(base_url) = self.base_url.clone() else {
            return Step::Fail(ErrorCode::ParameterError, "no base URL".to_string());
        };

        let mut downloader = Downloader::new(Arc::clone(&self.transport), Arc::clone(&self.codec))
            .with_concurrency(self.config.max_concurrent_downloads);
        let started = downloader.start(&root, &base_url, &diff.download, new.resources());
        self.new_store = Some(new);

        if started {
            self.pending = Pending::Bundles(downloader);
            return Step::Wait;
        }
        match downloader.error_code() {
            Some(code) => Step::Fail(code, downloader.last_error().unwrap_or_default()),
            None => Step::Next,
        }
    }

    /// Record completed bundles in the ledger with their new hashes.
    fn record_downloads(&mut self, downloader: &Downloader) {
        let Some(store) = &self.new_store else {
            return;
        };
        for name in downloader.complete_names() {
            if let Some(hash) = store.graph().hash(&name) {
                self.ledger.record(name.as_str(), hash);
            }
        }
    }

    fn copy_cache_file(&mut self) -> Step {
        match install::promote_configs(
            &self.config.root_dir,
            &self.config.cache_dir(),
            &self.config.config_files,
            &self.fetched_configs,
        ) {
            Ok(promoted) => {
                tracing::info!(promoted, "Installed config files");
                Step::Next
            }
            Err(failure) => Step::Fail(failure.code, failure.message),
        }
    }

    fn dispose(&mut self) {
        let cache_dir = self.config.cache_dir();
        let ledger_path = self.config.ledger_path();

        if self.error_code.is_none() && self.stopping == StopRequest::None {
            if let Err(e) = install::clear_dir(&cache_dir) {
                tracing::warn!(path = %cache_dir.display(), error = %e, "Failed to clear scratch cache");
            }
            if let Err(e) = DownloadLedger::delete_file(&ledger_path) {
                tracing::warn!(error = %e, "Failed to delete download ledger");
            }
            self.ledger = DownloadLedger::new();

            if let Some(cache) = &self.bundle_cache {
                if let Err(e) = cache.relaunch() {
                    tracing::warn!(error = %e, "Bundle cache relaunch failed");
                }
            }
            self.enter(UpdateState::Completed);
            return;
        }

        if self.error_code == Some(ErrorCode::DiskFull) {
            tracing::warn!("Disk full, discarding config files");
            install::discard_configs(&self.config.root_dir, &self.config.config_files);
            install::discard_configs(&cache_dir, &self.config.config_files);
        }

        if !self.ledger.is_empty() {
            if let Err(e) = self.ledger.save(&ledger_path) {
                tracing::warn!(error = %e, "Failed to persist download ledger");
            } else {
                tracing::info!(entries = self.ledger.len(), "Saved download ledger");
            }
        }

        let terminal = match (self.error_code, self.stopping) {
            (Some(_), _) => UpdateState::Failed,
            (None, StopRequest::Abort) => UpdateState::Abort,
            _ => UpdateState::Cancel,
        };
        self.enter(terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::GzipCodec;
    use crate::transfer::DirectoryTransport;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn machine(root: &TempDir) -> UpdateStateMachine {
        UpdateStateMachine::new(
            SyncConfig::new(root.path().join("root")),
            Arc::new(DirectoryTransport::new()),
            Arc::new(GzipCodec::new()),
        )
    }

    #[test]
    fn test_no_urls_is_parameter_error() {
        let temp = TempDir::new().unwrap();
        let mut update = machine(&temp);

        let status = update.run(Duration::from_millis(1));
        assert_eq!(status.state, UpdateState::Failed);
        assert_eq!(status.error_code, Some(ErrorCode::ParameterError));
        assert!(update.is_failed());
        assert!(temp.path().join("root").join("Cache").is_dir());
    }

    #[test]
    fn test_invalid_url() {
        let temp = TempDir::new().unwrap();
        let mut update = UpdateStateMachine::new(
            SyncConfig::new(temp.path().join("root")).with_url("/nonexistent/mirror"),
            Arc::new(DirectoryTransport::new()),
            Arc::new(GzipCodec::new()),
        );

        let status = update.run(Duration::from_millis(1));
        assert_eq!(status.error_code, Some(ErrorCode::InvalidUrl));
    }

    #[test]
    fn test_observers_and_restart() {
        let temp = TempDir::new().unwrap();
        let states = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&states);
        let done_count = Arc::clone(&done);
        let mut update = machine(&temp)
            .on_update(move |s| seen.lock().push(s.state))
            .on_done(move |_| {
                done_count.fetch_add(1, Ordering::SeqCst);
            });

        assert!(!update.restart());
        update.run(Duration::from_millis(1));
        update.poll();
        update.poll();

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(
            *states.lock(),
            vec![
                UpdateState::VerifyUrl,
                UpdateState::Dispose,
                UpdateState::Failed
            ]
        );

        assert!(update.restart());
        assert_eq!(update.state(), UpdateState::Initialize);
        assert_eq!(update.error_code(), None);
        update.run(Duration::from_millis(1));
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_before_start() {
        let temp = TempDir::new().unwrap();
        let mut update = machine(&temp);

        update.cancel();
        let status = update.poll();

        assert_eq!(status.state, UpdateState::Cancel);
        assert_eq!(status.error_code, None);
    }

    #[test]
    fn test_abort_overrides_cancel() {
        let temp = TempDir::new().unwrap();
        let mut update = machine(&temp);
        let handle = update.handle();

        handle.cancel();
        handle.abort();
        handle.cancel();
        assert_eq!(update.poll().state, UpdateState::Abort);
    }
}
