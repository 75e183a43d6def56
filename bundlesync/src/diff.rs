//! Three-way difference between an installed and a new manifest pair.
//!
//! Every bundle name seen in either dependency graph or either resources
//! manifest gets a [`Presence`] mask:
//!
//! ```text
//! bit0  IN_OLD_GRAPH   present in the old dependency graph
//! bit1  IN_NEW_GRAPH   present in the new dependency graph
//! bit2  OLD_NATIVE     native in the old resources manifest
//! bit3  NEW_NATIVE     native in the new resources manifest
//! ```
//!
//! The mask is classified with priority both > add > delete:
//!
//! - **both**: bit0 and bit1 (plus bit3 under [`DiffMode::OnlyInitial`]).
//!   Downloaded when the graph hashes differ and the local file exists.
//! - **add**: bit3 without bit2. Always downloaded.
//! - **delete**: bit0 and neither of the above. Deleted only when the local
//!   file exists.
//!
//! Finally, downloads already recorded in the resume ledger with the new hash
//! (and present on disk) are dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};

use crate::ledger::DownloadLedger;
use crate::manifest::{DependencyGraph, ResourcesManifest};

/// Membership mask of a bundle across the four manifests.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Presence(u8);

impl Presence {
    /// No membership.
    pub const NONE: Presence = Presence(0);
    /// Present in the old dependency graph.
    pub const IN_OLD_GRAPH: Presence = Presence(1 << 0);
    /// Present in the new dependency graph.
    pub const IN_NEW_GRAPH: Presence = Presence(1 << 1);
    /// Native in the old resources manifest.
    pub const OLD_NATIVE: Presence = Presence(1 << 2);
    /// Native in the new resources manifest.
    pub const NEW_NATIVE: Presence = Presence(1 << 3);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: Presence) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Presence {
    type Output = Presence;

    fn bitor(self, rhs: Presence) -> Presence {
        Presence(self.0 | rhs.0)
    }
}

impl BitOrAssign for Presence {
    fn bitor_assign(&mut self, rhs: Presence) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Presence({:04b})", self.0)
    }
}

/// Which bundles take part in the "both" comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    /// Only bundles that are native in the new manifest are compared.
    OnlyInitial,
    /// Every bundle present in both graphs is compared.
    All,
}

/// Classification of a single presence mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Candidate for update.
    Both,
    /// Newly native bundle.
    Add,
    /// Candidate for deletion.
    Delete,
    /// Nothing to do.
    Untracked,
}

impl Classification {
    /// Classify a mask under the given mode.
    pub fn of(mask: Presence, mode: DiffMode) -> Self {
        let in_both = mask.contains(Presence::IN_OLD_GRAPH | Presence::IN_NEW_GRAPH);
        let both = match mode {
            DiffMode::All => in_both,
            DiffMode::OnlyInitial => in_both && mask.contains(Presence::NEW_NATIVE),
        };

        if both {
            Classification::Both
        } else if mask.contains(Presence::NEW_NATIVE) && !mask.contains(Presence::OLD_NATIVE) {
            Classification::Add
        } else if mask.contains(Presence::IN_OLD_GRAPH) {
            Classification::Delete
        } else {
            Classification::Untracked
        }
    }
}

/// Result of a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleDiff {
    /// Bundles to fetch.
    pub download: BTreeSet<String>,
    /// Bundles to remove from disk.
    pub delete: BTreeSet<String>,
}

impl BundleDiff {
    /// Whether nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.download.is_empty() && self.delete.is_empty()
    }
}

/// Computes [`BundleDiff`]s against the bundles installed under a directory.
///
/// Never mutates the manifests it is given.
#[derive(Debug)]
pub struct DifferenceCalculator<'a> {
    bundle_dir: PathBuf,
    ledger: Option<&'a DownloadLedger>,
}

impl<'a> DifferenceCalculator<'a> {
    /// Create a calculator for bundles stored in `bundle_dir`.
    pub fn new(bundle_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
            ledger: None,
        }
    }

    /// Apply the resume post-filter using `ledger`.
    pub fn with_ledger(mut self, ledger: &'a DownloadLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Directory holding the installed bundles.
    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    /// Presence masks for every bundle name in the four manifests.
    pub fn presence(
        old_graph: &DependencyGraph,
        new_graph: &DependencyGraph,
        old_resources: &ResourcesManifest,
        new_resources: &ResourcesManifest,
    ) -> BTreeMap<String, Presence> {
        let mut masks: BTreeMap<String, Presence> = BTreeMap::new();

        for name in old_graph.names() {
            *masks.entry(name.to_string()).or_default() |= Presence::IN_OLD_GRAPH;
        }
        for name in new_graph.names() {
            *masks.entry(name.to_string()).or_default() |= Presence::IN_NEW_GRAPH;
        }
        for name in old_resources.native_bundles() {
            *masks.entry(name.to_string()).or_default() |= Presence::OLD_NATIVE;
        }
        for name in new_resources.native_bundles() {
            *masks.entry(name.to_string()).or_default() |= Presence::NEW_NATIVE;
        }

        masks
    }

    /// Compute the download and delete sets.
    pub fn diff(
        &self,
        old_graph: &DependencyGraph,
        new_graph: &DependencyGraph,
        old_resources: &ResourcesManifest,
        new_resources: &ResourcesManifest,
        mode: DiffMode,
    ) -> BundleDiff {
        let masks = Self::presence(old_graph, new_graph, old_resources, new_resources);
        let mut result = BundleDiff::default();

        for (name, mask) in masks {
            match Classification::of(mask, mode) {
                Classification::Both => {
                    if old_graph.hash(&name) != new_graph.hash(&name) && self.exists(&name) {
                        result.download.insert(name);
                    }
                }
                Classification::Add => {
                    result.download.insert(name);
                }
                Classification::Delete => {
                    if self.exists(&name) {
                        result.delete.insert(name);
                    }
                }
                Classification::Untracked => {}
            }
        }

        if let Some(ledger) = self.ledger {
            result.download.retain(|name| {
                let fetched = new_graph
                    .hash(name)
                    .map(|hash| ledger.is_fresh(name, hash))
                    .unwrap_or(false);
                let skip = fetched && self.exists(name);
                if skip {
                    tracing::debug!(bundle = %name, "Skipping bundle already fetched by a previous attempt");
                }
                !skip
            });
        }

        tracing::debug!(
            download = result.download.len(),
            delete = result.delete.len(),
            ?mode,
            "Computed bundle diff"
        );

        result
    }

    fn exists(&self, name: &str) -> bool {
        self.bundle_dir.join(name).is_file()
    }
}
