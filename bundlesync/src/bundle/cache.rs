//! The bundle cache service object.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::{BundleLoader, BundleLocator, CacheError, Relaunch};
use crate::manifest::{ManifestPaths, ManifestStore};

/// Lifecycle of a [`BundleCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Not launched, or shut down.
    Idle,
    /// Reading manifests and loading startup bundles.
    Launching,
    /// Serving loads.
    Ready,
    /// The last launch failed.
    Failed,
}

struct CacheEntry<H> {
    handle: H,
    ref_count: usize,
}

struct Pools<H> {
    state: CacheState,
    manifests: Option<Arc<ManifestStore>>,
    /// Bumped on every launch and shutdown; loads started under an older
    /// generation are refused.
    generation: u64,
    permanent: HashMap<String, H>,
    cache: HashMap<String, CacheEntry<H>>,
    loading: HashSet<String>,
    /// Load calls between claiming the manifests and returning.
    in_flight: usize,
    /// Outstanding `load_with_dependencies` calls per bundle.
    closures: HashMap<String, usize>,
}

impl<H> Pools<H> {
    /// Empty both resident pools.
    fn drain(&mut self) -> Vec<(String, H)> {
        self.closures.clear();
        let mut handles: Vec<(String, H)> = mem::take(&mut self.permanent).into_iter().collect();
        handles.extend(
            mem::take(&mut self.cache)
                .into_iter()
                .map(|(name, entry)| (name, entry.handle)),
        );
        handles
    }
}

/// Manifests and generation a load call runs against.
struct LoadTicket {
    store: Arc<ManifestStore>,
    generation: u64,
}

struct Inner<L: BundleLoader> {
    loader: L,
    locator: Box<dyn BundleLocator>,
    manifest_dir: PathBuf,
    paths: ManifestPaths,
    pools: Mutex<Pools<L::Handle>>,
    loaded: Condvar,
}

/// Reference-counted cache of loaded bundles.
///
/// Cloning is cheap and shares the cache.
///
/// # Example
///
/// ```ignore
/// let cache = BundleCache::new(
///     FileBundleLoader::new(),
///     LayeredLocator::new(&root, &install_dir),
///     &root,
///     ManifestPaths::default(),
/// );
/// cache.launch()?;
/// let level = cache.load_with_dependencies("level1")?;
/// // ...
/// cache.unload_with_dependencies("level1");
/// ```
pub struct BundleCache<L: BundleLoader> {
    inner: Arc<Inner<L>>,
}

impl<L: BundleLoader> Clone for BundleCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: BundleLoader> BundleCache<L> {
    /// Create an idle cache reading manifests from `manifest_dir`.
    pub fn new(
        loader: L,
        locator: impl BundleLocator + 'static,
        manifest_dir: impl Into<PathBuf>,
        paths: ManifestPaths,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader,
                locator: Box::new(locator),
                manifest_dir: manifest_dir.into(),
                paths,
                pools: Mutex::new(Pools {
                    state: CacheState::Idle,
                    manifests: None,
                    generation: 0,
                    permanent: HashMap::new(),
                    cache: HashMap::new(),
                    loading: HashSet::new(),
                    in_flight: 0,
                    closures: HashMap::new(),
                }),
                loaded: Condvar::new(),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CacheState {
        self.inner.pools.lock().state
    }

    /// Manifests read at the last launch.
    pub fn manifests(&self) -> Option<Arc<ManifestStore>> {
        self.inner.pools.lock().manifests.clone()
    }

    /// Read the live manifests and load the startup bundles.
    ///
    /// Launching a ready cache does nothing.
    pub fn launch(&self) -> Result<(), CacheError> {
        {
            let mut pools = self.inner.pools.lock();
            match pools.state {
                CacheState::Launching => return Err(CacheError::Busy),
                CacheState::Ready => return Ok(()),
                CacheState::Idle | CacheState::Failed => pools.state = CacheState::Launching,
            }
        }
        self.launch_claimed()
    }

    /// Launch with the state already set to `Launching` by the caller.
    fn launch_claimed(&self) -> Result<(), CacheError> {
        let store = match ManifestStore::load_or_empty(&self.inner.manifest_dir, &self.inner.paths) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, "Bundle cache launch failed");
                self.inner.pools.lock().state = CacheState::Failed;
                return Err(e.into());
            }
        };
        let ticket = {
            let mut pools = self.inner.pools.lock();
            pools.generation += 1;
            pools.manifests = Some(Arc::clone(&store));
            LoadTicket {
                store: Arc::clone(&store),
                generation: pools.generation,
            }
        };

        let startup: Vec<String> = store.resources().startup_bundles().map(str::to_string).collect();
        for name in &startup {
            if let Err(e) = self.acquire_with_dependencies(&ticket, name) {
                tracing::warn!(bundle = %name, error = %e, "Startup bundle failed to load");
                self.release_all(CacheState::Failed);
                return Err(e);
            }
        }

        {
            let mut pools = self.inner.pools.lock();
            // Shut down while the startup bundles were loading.
            if pools.generation != ticket.generation {
                return Err(CacheError::NotReady);
            }
            pools.state = CacheState::Ready;
        }
        tracing::info!(
            version = %store.version(),
            bundles = store.resources().len(),
            startup = startup.len(),
            "Bundle cache ready"
        );
        Ok(())
    }

    /// Release every resident bundle and return to `Idle`.
    ///
    /// Waits for loads already in flight to land first.
    pub fn shutdown(&self) {
        let released = self.release_all(CacheState::Idle);
        tracing::info!(released, "Bundle cache shut down");
    }

    fn release_all(&self, next: CacheState) -> usize {
        let handles = {
            let mut pools = self.inner.pools.lock();
            while !pools.loading.is_empty() {
                self.inner.loaded.wait(&mut pools);
            }
            pools.generation += 1;
            pools.state = next;
            pools.manifests = None;
            pools.drain()
        };
        let count = handles.len();
        for (name, handle) in handles {
            self.inner.loader.release(&name, handle);
        }
        count
    }

    /// Shut down and launch again.
    ///
    /// Only allowed from `Ready` or `Failed` with no load call in progress,
    /// including one between two dependencies of the same closure.
    pub fn relaunch(&self) -> Result<(), CacheError> {
        let handles = {
            let mut pools = self.inner.pools.lock();
            let settled = matches!(pools.state, CacheState::Ready | CacheState::Failed);
            if !settled || !pools.loading.is_empty() || pools.in_flight > 0 {
                return Err(CacheError::Busy);
            }
            pools.state = CacheState::Launching;
            pools.manifests = None;
            pools.drain()
        };
        tracing::info!(released = handles.len(), "Relaunching bundle cache");
        for (name, handle) in handles {
            self.inner.loader.release(&name, handle);
        }
        self.launch_claimed()
    }

    /// Claim the current manifests for a load call. Every successful claim
    /// must be paired with [`end_load`](Self::end_load).
    fn begin_load(&self) -> Result<LoadTicket, CacheError> {
        let mut pools = self.inner.pools.lock();
        let store = match (&pools.state, &pools.manifests) {
            (CacheState::Ready, Some(store)) => Arc::clone(store),
            _ => return Err(CacheError::NotReady),
        };
        pools.in_flight += 1;
        Ok(LoadTicket {
            store,
            generation: pools.generation,
        })
    }

    fn end_load(&self) {
        let mut pools = self.inner.pools.lock();
        pools.in_flight = pools.in_flight.saturating_sub(1);
    }

    /// Load a single bundle, ignoring its dependencies.
    ///
    /// A resident bundle is returned as is; cache-pool bundles gain a
    /// reference. Concurrent loads of the same name wait for the first.
    pub fn load(&self, name: &str) -> Result<L::Handle, CacheError> {
        let ticket = self.begin_load()?;
        let result = self.acquire(&ticket, name);
        self.end_load();
        result
    }

    fn acquire(&self, ticket: &LoadTicket, name: &str) -> Result<L::Handle, CacheError> {
        let store = &ticket.store;
        let mut pools = self.inner.pools.lock();
        loop {
            if pools.generation != ticket.generation {
                return Err(CacheError::NotReady);
            }
            if let Some(handle) = pools.permanent.get(name) {
                return Ok(handle.clone());
            }
            if let Some(entry) = pools.cache.get_mut(name) {
                entry.ref_count += 1;
                return Ok(entry.handle.clone());
            }
            if !pools.loading.contains(name) {
                break;
            }
            self.inner.loaded.wait(&mut pools);
        }

        if !store.resources().contains(name) && !store.graph().contains(name) {
            return Err(CacheError::BundleNotFound {
                name: name.to_string(),
            });
        }
        pools.loading.insert(name.to_string());
        drop(pools);

        let result = match self.inner.locator.locate(name) {
            Some(path) => self.inner.loader.load(name, &path),
            None => Err(CacheError::BundleNotFound {
                name: name.to_string(),
            }),
        };

        let mut pools = self.inner.pools.lock();
        pools.loading.remove(name);
        self.inner.loaded.notify_all();
        let handle = result?;

        if pools.generation != ticket.generation {
            drop(pools);
            self.inner.loader.release(name, handle);
            return Err(CacheError::NotReady);
        }
        if store.is_permanent(name) {
            pools.permanent.insert(name.to_string(), handle.clone());
        } else {
            pools.cache.insert(
                name.to_string(),
                CacheEntry {
                    handle: handle.clone(),
                    ref_count: 1,
                },
            );
        }
        tracing::debug!(bundle = name, permanent = store.is_permanent(name), "Loaded bundle");
        Ok(handle)
    }

    /// Load a bundle after its whole dependency closure.
    ///
    /// Every file in the closure is checked before anything is loaded, so a
    /// missing dependency leaves the cache untouched. Pair each successful
    /// call with [`unload_with_dependencies`](Self::unload_with_dependencies).
    pub fn load_with_dependencies(&self, name: &str) -> Result<L::Handle, CacheError> {
        let ticket = self.begin_load()?;
        let result = self.acquire_with_dependencies(&ticket, name);
        self.end_load();
        result
    }

    fn acquire_with_dependencies(
        &self,
        ticket: &LoadTicket,
        name: &str,
    ) -> Result<L::Handle, CacheError> {
        let store = &ticket.store;
        if !store.resources().contains(name) && !store.graph().contains(name) {
            return Err(CacheError::BundleNotFound {
                name: name.to_string(),
            });
        }

        let closure = store.graph().dependency_closure(name);
        for dep in &closure {
            if self.is_resident(dep) || self.inner.locator.locate(dep).is_some() {
                continue;
            }
            return Err(if dep == name {
                CacheError::BundleNotFound {
                    name: name.to_string(),
                }
            } else {
                CacheError::DependencyMissing {
                    name: name.to_string(),
                    dependency: dep.clone(),
                }
            });
        }

        let mut acquired: Vec<&str> = Vec::with_capacity(closure.len());
        let mut handle = None;
        for dep in &closure {
            match self.acquire(ticket, dep) {
                Ok(h) => {
                    acquired.push(dep);
                    handle = Some(h);
                }
                Err(e) => {
                    for loaded in acquired.iter().rev() {
                        self.unload(loaded);
                    }
                    return Err(e);
                }
            }
        }

        let handle = handle.ok_or_else(|| CacheError::BundleNotFound {
            name: name.to_string(),
        })?;

        let mut pools = self.inner.pools.lock();
        if pools.generation == ticket.generation {
            *pools.closures.entry(name.to_string()).or_insert(0) += 1;
        }
        Ok(handle)
    }

    /// Drop one reference. Returns `true` when the handle was released.
    ///
    /// Permanent and non-resident bundles are left alone.
    pub fn unload(&self, name: &str) -> bool {
        let released = {
            let mut pools = self.inner.pools.lock();
            match pools.cache.get_mut(name) {
                Some(entry) if entry.ref_count > 1 => {
                    entry.ref_count -= 1;
                    None
                }
                Some(_) => pools.cache.remove(name).map(|entry| entry.handle),
                None => None,
            }
        };

        match released {
            Some(handle) => {
                self.inner.loader.release(name, handle);
                tracing::debug!(bundle = name, "Unloaded bundle");
                true
            }
            None => false,
        }
    }

    /// Undo one [`load_with_dependencies`](Self::load_with_dependencies):
    /// drop a reference on the bundle and each of its dependencies,
    /// dependents first.
    ///
    /// Without an outstanding `load_with_dependencies` for `name` this only
    /// drops the bundle's own reference, so dependencies held by other
    /// owners are left alone.
    pub fn unload_with_dependencies(&self, name: &str) {
        let store = {
            let mut pools = self.inner.pools.lock();
            match pools.closures.get_mut(name) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        pools.closures.remove(name);
                    }
                    pools.manifests.clone()
                }
                None => None,
            }
        };

        match store {
            Some(store) => {
                for dep in store.graph().dependency_closure(name).iter().rev() {
                    self.unload(dep);
                }
            }
            None => {
                self.unload(name);
            }
        }
    }

    /// Load a bundle and its dependencies on a worker thread.
    ///
    /// The load counts as in progress from this call on, so a relaunch is
    /// refused until the worker finishes.
    pub fn load_async(&self, name: &str) -> AsyncLoad<L::Handle> {
        let slot = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));

        let ticket = match self.begin_load() {
            Ok(ticket) => ticket,
            Err(e) => {
                *slot.lock() = Some(Err(e));
                done.store(true, Ordering::Release);
                return AsyncLoad {
                    name: name.to_string(),
                    slot,
                    done,
                    worker: None,
                };
            }
        };

        let cache = self.clone();
        let worker_slot = Arc::clone(&slot);
        let worker_done = Arc::clone(&done);
        let bundle = name.to_string();
        let spawned = thread::Builder::new()
            .name(format!("bundlesync-load-{}", name))
            .spawn(move || {
                let result = cache.acquire_with_dependencies(&ticket, &bundle);
                cache.end_load();
                *worker_slot.lock() = Some(result);
                worker_done.store(true, Ordering::Release);
            });

        let worker = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.end_load();
                *slot.lock() = Some(Err(CacheError::Load {
                    name: name.to_string(),
                    reason: format!("failed to spawn loader thread: {}", e),
                }));
                done.store(true, Ordering::Release);
                None
            }
        };

        AsyncLoad {
            name: name.to_string(),
            slot,
            done,
            worker,
        }
    }

    /// Reference count of a cache-pool bundle; `None` for permanent or
    /// non-resident bundles.
    pub fn ref_count(&self, name: &str) -> Option<usize> {
        self.inner.pools.lock().cache.get(name).map(|e| e.ref_count)
    }

    /// Whether the bundle is in the permanent or the cache pool.
    pub fn is_resident(&self, name: &str) -> bool {
        let pools = self.inner.pools.lock();
        pools.permanent.contains_key(name) || pools.cache.contains_key(name)
    }

    /// Whether the bundle is in the permanent pool.
    pub fn is_permanent_resident(&self, name: &str) -> bool {
        self.inner.pools.lock().permanent.contains_key(name)
    }

    /// Number of resident bundles across both pools.
    pub fn resident_count(&self) -> usize {
        let pools = self.inner.pools.lock();
        pools.permanent.len() + pools.cache.len()
    }
}

impl<L: BundleLoader> Relaunch for BundleCache<L> {
    fn relaunch(&self) -> Result<(), CacheError> {
        BundleCache::relaunch(self)
    }
}

/// A bundle load running on a worker thread. Poll with [`AsyncLoad::is_done`].
pub struct AsyncLoad<H> {
    name: String,
    slot: Arc<Mutex<Option<Result<H, CacheError>>>>,
    done: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<H> AsyncLoad<H> {
    /// Bundle being loaded.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the result is available.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Take the result once done. Returns `None` while pending or after the
    /// result was taken.
    pub fn take(&mut self) -> Option<Result<H, CacheError>> {
        if !self.is_done() {
            return None;
        }
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
        self.slot.lock().take()
    }

    /// Block until the load finishes.
    pub fn wait(mut self) -> Result<H, CacheError> {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                return Err(CacheError::Load {
                    name: self.name.clone(),
                    reason: "loader thread panicked".to_string(),
                });
            }
        }
        self.slot.lock().take().unwrap_or_else(|| {
            Err(CacheError::Load {
                name: self.name.clone(),
                reason: "result already taken".to_string(),
            })
        })
    }
}
