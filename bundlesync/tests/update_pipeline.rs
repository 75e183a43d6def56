//! Integration tests for the update pipeline.
//!
//! These tests drive [`UpdateStateMachine`] end to end against a mirror
//! directory:
//! - manifest fetch → diff → bundle download → install
//! - resume through the download ledger after a failed attempt
//! - cancel and abort while bundles are in flight
//! - bundle cache relaunch after a successful update
//!
//! Run with: `cargo test --test update_pipeline`

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use bundlesync::bundle::{BundleCache, CacheState, FileBundleLoader, PersistentLocator};
use bundlesync::codec::GzipCodec;
use bundlesync::config::SyncConfig;
use bundlesync::download::calculate_file_checksum;
use bundlesync::error::ErrorCode;
use bundlesync::ledger::DownloadLedger;
use bundlesync::manifest::{
    BundleDescriptor, DependencyGraph, ManifestPaths, ManifestStore, ResourcesManifest,
};
use bundlesync::transfer::{DirectoryTransport, FetchControl, ProgressFn, TransferError, Transport};
use bundlesync::update::{UpdateState, UpdateStateMachine};

// ============================================================================
// Helper Functions
// ============================================================================

const TICK: Duration = Duration::from_millis(2);

/// Directory transport that records every fetched file name and can slow
/// bundle transfers down, stall them, or report a full disk.
#[derive(Default)]
struct RecordingTransport {
    inner: DirectoryTransport,
    fetched: Mutex<Vec<String>>,
    bundle_delay: Duration,
    /// Blocks without looking at the abort flag, like a stuck socket read.
    bundle_stall: Duration,
    disk_full_on: Option<String>,
}

impl RecordingTransport {
    fn slow(delay: Duration) -> Self {
        Self {
            bundle_delay: delay,
            ..Self::default()
        }
    }

    fn stalled(stall: Duration) -> Self {
        Self {
            bundle_stall: stall,
            ..Self::default()
        }
    }

    fn disk_full_on(name: &str) -> Self {
        Self {
            disk_full_on: Some(name.to_string()),
            ..Self::default()
        }
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn probe(&self, url: &str, timeout: Duration) -> bool {
        self.inner.probe(url, timeout)
    }

    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        control: &FetchControl,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, TransferError> {
        let name = url.rsplit('/').next().unwrap_or(url).to_string();
        self.fetched.lock().push(name.clone());

        let is_manifest = ManifestPaths::default().file_names().contains(&name.as_str());
        if self.disk_full_on.as_deref() == Some(name.as_str()) {
            return Err(TransferError::DiskFull {
                path: dest.to_path_buf(),
            });
        }
        if !is_manifest {
            thread::sleep(self.bundle_stall);
            let deadline = Instant::now() + self.bundle_delay;
            while Instant::now() < deadline {
                if control.is_aborted() {
                    return Err(TransferError::Aborted {
                        url: url.to_string(),
                    });
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        self.inner.fetch(url, dest, control, on_progress)
    }
}

/// Installed set: version 1.0 with native bundles a, b and c.
fn install_live(root: &Path) {
    let graph = DependencyGraph::new()
        .with_bundle("a", "h1", Vec::<String>::new())
        .with_bundle("b", "h1", ["a"])
        .with_bundle("c", "h1", Vec::<String>::new());
    let resources = ResourcesManifest::new(
        "1.0",
        vec![
            BundleDescriptor::new("a", 4)
                .with_native(true)
                .with_permanent(true)
                .with_startup_load(true),
            BundleDescriptor::new("b", 4).with_native(true),
            BundleDescriptor::new("c", 4).with_native(true),
        ],
    );
    fs::create_dir_all(root).unwrap();
    ManifestStore::new(graph, resources)
        .save(root, &ManifestPaths::default())
        .unwrap();
    for name in ["a", "b", "c"] {
        fs::write(root.join(name), format!("{}-v1", name)).unwrap();
    }
}

/// Release on the mirror: b changed, c dropped, d added.
fn publish(mirror: &Path, version: &str, with_b: bool) {
    fs::write(mirror.join("a"), "a-v1").unwrap();
    fs::write(mirror.join("d"), "d-v1").unwrap();
    if with_b {
        fs::write(mirror.join("b"), "b-v2").unwrap();
    }
    let d_checksum = calculate_file_checksum(&mirror.join("d")).unwrap();

    let graph = DependencyGraph::new()
        .with_bundle("a", "h1", Vec::<String>::new())
        .with_bundle("b", "h2", ["a"])
        .with_bundle("d", "h1", ["b"]);
    let resources = ResourcesManifest::new(
        version,
        vec![
            BundleDescriptor::new("a", 4)
                .with_native(true)
                .with_permanent(true)
                .with_startup_load(true),
            BundleDescriptor::new("b", 4).with_native(true),
            BundleDescriptor::new("d", 4)
                .with_native(true)
                .with_checksum(d_checksum),
        ],
    );
    ManifestStore::new(graph, resources)
        .save(mirror, &ManifestPaths::default())
        .unwrap();
}

struct Fixture {
    _temp: TempDir,
    root: std::path::PathBuf,
    mirror: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let mirror = temp.path().join("mirror");
        fs::create_dir_all(&mirror).unwrap();
        install_live(&root);
        Self {
            _temp: temp,
            root,
            mirror,
        }
    }

    fn config(&self) -> SyncConfig {
        SyncConfig::new(&self.root)
            .with_url(self.mirror.display().to_string())
            .with_max_concurrent_downloads(1)
    }

    fn machine(&self, transport: Arc<RecordingTransport>) -> UpdateStateMachine {
        UpdateStateMachine::new(self.config(), transport, Arc::new(GzipCodec::new()))
    }

    fn live_version(&self) -> String {
        ManifestStore::load(&self.root, &ManifestPaths::default())
            .unwrap()
            .version()
            .to_string()
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.root.join(name)).unwrap()
    }

    fn ledger(&self) -> DownloadLedger {
        DownloadLedger::load(&self.config().ledger_path())
    }
}

fn bundle_fetches(transport: &RecordingTransport) -> Vec<String> {
    let manifests = ManifestPaths::default();
    transport
        .fetched()
        .into_iter()
        .filter(|name| !manifests.file_names().contains(&name.as_str()))
        .collect()
}

/// Poll until `state` is reached, failing after a few seconds.
fn poll_until(update: &mut UpdateStateMachine, state: UpdateState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while update.state() != state {
        assert!(Instant::now() < deadline, "never reached {}", state);
        assert!(!update.is_done(), "finished as {} before {}", update.state(), state);
        update.poll();
        thread::sleep(TICK);
    }
}

// ============================================================================
// Successful Updates
// ============================================================================

#[test]
fn test_update_installs_changed_bundles() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);
    let transport = Arc::new(RecordingTransport::default());

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let mut update = fixture
        .machine(Arc::clone(&transport))
        .on_update(move |status| seen.lock().push(status.progress));

    let status = update.run(TICK);

    assert_eq!(status.state, UpdateState::Completed);
    assert_eq!(status.error_code, None);
    assert_eq!(status.progress, 1.0);

    // b changed, d is new, a is unchanged.
    let mut fetched = bundle_fetches(&transport);
    fetched.sort();
    assert_eq!(fetched, vec!["b", "d"]);

    assert_eq!(fixture.read("a"), "a-v1");
    assert_eq!(fixture.read("b"), "b-v2");
    assert_eq!(fixture.read("d"), "d-v1");
    assert!(!fixture.root.join("c").exists());
    assert_eq!(fixture.live_version(), "1.1");

    // Scratch cache and ledger are gone after success.
    assert!(!fixture.config().cache_dir().exists());

    let progress = progress.lock();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
}

#[test]
fn test_update_with_nothing_to_download() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);
    let first = Arc::new(RecordingTransport::default());
    assert_eq!(fixture.machine(first).run(TICK).state, UpdateState::Completed);

    let second = Arc::new(RecordingTransport::default());
    let status = fixture.machine(Arc::clone(&second)).run(TICK);

    assert_eq!(status.state, UpdateState::Completed);
    assert!(bundle_fetches(&second).is_empty());
}

#[test]
fn test_relaunches_bundle_cache() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);

    let cache = BundleCache::new(
        FileBundleLoader::new(),
        PersistentLocator::new(&fixture.root),
        &fixture.root,
        ManifestPaths::default(),
    );
    cache.launch().unwrap();
    assert_eq!(cache.manifests().unwrap().version().to_string(), "1.0");
    assert!(cache.is_permanent_resident("a"));

    let status = fixture
        .machine(Arc::new(RecordingTransport::default()))
        .with_bundle_cache(Arc::new(cache.clone()))
        .run(TICK);

    assert_eq!(status.state, UpdateState::Completed);
    assert_eq!(cache.state(), CacheState::Ready);
    assert_eq!(cache.manifests().unwrap().version().to_string(), "1.1");
    assert!(cache.is_permanent_resident("a"));

    // d depends on b, which is now the new build.
    cache.load_with_dependencies("d").unwrap();
    assert_eq!(cache.ref_count("b"), Some(1));
    assert_eq!(cache.ref_count("d"), Some(1));
}

// ============================================================================
// Failures and Resume
// ============================================================================

#[test]
fn test_failed_update_resumes_from_ledger() {
    let fixture = Fixture::new();
    // b missing on the mirror: d (taken first) succeeds, b fails.
    publish(&fixture.mirror, "1.1", false);

    let transport = Arc::new(RecordingTransport::default());
    let mut update = fixture.machine(Arc::clone(&transport));
    let status = update.run(TICK);

    assert_eq!(status.state, UpdateState::Failed);
    assert_eq!(status.error_code, Some(ErrorCode::DownloadFailed));
    assert_eq!(bundle_fetches(&transport), vec!["d", "b"]);

    // Live manifests and the old b survive; d is recorded for the next try.
    assert_eq!(fixture.live_version(), "1.0");
    assert_eq!(fixture.read("b"), "b-v1");
    assert!(!fixture.root.join("c").exists());
    let ledger = fixture.ledger();
    assert_eq!(ledger.len(), 1);
    assert!(ledger.is_fresh("d", "h1"));

    // Publish b and retry: only b is fetched.
    fs::write(fixture.mirror.join("b"), "b-v2").unwrap();
    assert!(update.restart());
    let status = update.run(TICK);

    assert_eq!(status.state, UpdateState::Completed);
    assert_eq!(bundle_fetches(&transport), vec!["d", "b", "b"]);
    assert_eq!(fixture.read("b"), "b-v2");
    assert_eq!(fixture.live_version(), "1.1");
    assert!(!fixture.config().ledger_path().exists());
}

#[test]
fn test_disk_full_discards_config_files() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);
    // d is taken first and lands, b hits a full disk.
    let transport = Arc::new(RecordingTransport::disk_full_on("b"));
    let mut update = fixture.machine(Arc::clone(&transport));

    let status = update.run(TICK);

    assert_eq!(status.state, UpdateState::Failed);
    assert_eq!(status.error_code, Some(ErrorCode::DiskFull));
    assert_eq!(bundle_fetches(&transport), vec!["d", "b"]);

    // Live and scratch config files are gone so the next launch starts over.
    let config = fixture.config();
    for spec in &config.config_files {
        assert!(!fixture.root.join(&spec.name).exists(), "live {} kept", spec.name);
        assert!(!config.cache_dir().join(&spec.name).exists(), "scratch {} kept", spec.name);
    }
    assert!(fixture.ledger().is_fresh("d", "h1"));

    // A full disk is not retried.
    assert!(!update.restart());
    assert_eq!(update.state(), UpdateState::Failed);
}

#[test]
fn test_missing_required_manifest_fails() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);
    fs::remove_file(fixture.mirror.join(&ManifestPaths::default().resources_file)).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let status = fixture.machine(Arc::clone(&transport)).run(TICK);

    assert_eq!(status.state, UpdateState::Failed);
    assert_eq!(status.error_code, Some(ErrorCode::DownloadFailed));
    assert!(bundle_fetches(&transport).is_empty());
    assert_eq!(fixture.live_version(), "1.0");
    assert_eq!(fixture.read("c"), "c-v1");
}

#[test]
fn test_downgrade_refused() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "0.9", true);

    let transport = Arc::new(RecordingTransport::default());
    let status = fixture.machine(Arc::clone(&transport)).run(TICK);

    assert_eq!(status.state, UpdateState::Failed);
    assert_eq!(status.error_code, Some(ErrorCode::PreprocessError));
    assert!(bundle_fetches(&transport).is_empty());
    assert_eq!(fixture.live_version(), "1.0");
}

#[test]
fn test_downgrade_allowed_by_config() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "0.9", true);

    let mut update = UpdateStateMachine::new(
        fixture.config().with_allow_downgrade(true),
        Arc::new(RecordingTransport::default()),
        Arc::new(GzipCodec::new()),
    );

    assert_eq!(update.run(TICK).state, UpdateState::Completed);
    assert_eq!(fixture.live_version(), "0.9");
}

#[test]
fn test_no_reachable_url() {
    let fixture = Fixture::new();
    let mut update = UpdateStateMachine::new(
        SyncConfig::new(&fixture.root).with_urls(["/nonexistent/one", "/nonexistent/two"]),
        Arc::new(RecordingTransport::default()),
        Arc::new(GzipCodec::new()),
    );

    let status = update.run(TICK);
    assert_eq!(status.error_code, Some(ErrorCode::InvalidUrl));
    assert_eq!(update.base_url(), None);
}

#[test]
fn test_first_reachable_url_wins() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);
    let mut update = UpdateStateMachine::new(
        fixture
            .config()
            .with_urls(["/nonexistent/one".to_string(), fixture.mirror.display().to_string()]),
        Arc::new(RecordingTransport::default()),
        Arc::new(GzipCodec::new()),
    );

    assert_eq!(update.run(TICK).state, UpdateState::Completed);
    assert_eq!(update.base_url(), Some(fixture.mirror.display().to_string().as_str()));
}

// ============================================================================
// Cancel and Abort
// ============================================================================

#[test]
fn test_cancel_finishes_current_bundle() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);
    let transport = Arc::new(RecordingTransport::slow(Duration::from_millis(200)));

    let done = Arc::new(AtomicUsize::new(0));
    let done_count = Arc::clone(&done);
    let mut update = fixture.machine(Arc::clone(&transport)).on_done(move |_| {
        done_count.fetch_add(1, Ordering::SeqCst);
    });

    poll_until(&mut update, UpdateState::UpdateAssetBundle);
    update.poll(); // starts the downloader
    update.handle().cancel();
    let status = update.run(TICK);

    assert_eq!(status.state, UpdateState::Cancel);
    assert_eq!(status.error_code, None);
    assert_eq!(done.load(Ordering::SeqCst), 1);

    // The bundle in flight completed and was recorded; nothing was installed.
    assert_eq!(bundle_fetches(&transport), vec!["d"]);
    assert!(fixture.ledger().is_fresh("d", "h1"));
    assert_eq!(fixture.live_version(), "1.0");
}

#[test]
fn test_abort_interrupts_transfer() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);
    let transport = Arc::new(RecordingTransport::slow(Duration::from_secs(30)));
    let mut update = fixture.machine(Arc::clone(&transport));

    poll_until(&mut update, UpdateState::UpdateAssetBundle);
    update.poll();
    let started = Instant::now();
    update.abort();
    let status = update.run(TICK);

    assert_eq!(status.state, UpdateState::Abort);
    assert_eq!(status.error_code, None);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(fixture.ledger().is_empty());
    assert_eq!(fixture.live_version(), "1.0");
}

#[test]
fn test_abort_does_not_wait_for_stalled_transfer() {
    let fixture = Fixture::new();
    publish(&fixture.mirror, "1.1", true);
    let transport = Arc::new(RecordingTransport::stalled(Duration::from_secs(3)));
    let mut update = fixture.machine(Arc::clone(&transport));

    poll_until(&mut update, UpdateState::UpdateAssetBundle);
    update.poll();
    update.abort();
    let started = Instant::now();
    let status = update.poll();

    assert!(
        started.elapsed() < Duration::from_millis(500),
        "poll blocked for {:?}",
        started.elapsed()
    );
    assert_eq!(status.state, UpdateState::Abort);
    assert!(fixture.ledger().is_empty());
    assert_eq!(fixture.live_version(), "1.0");
}
