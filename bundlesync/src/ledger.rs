//! Resume ledger: content hash of every bundle fetched by an unfinished update.
//!
//! Entries are recorded as downloads complete, persisted when an update stops
//! short (failure, cancel, abort), pruned against the new dependency graph at
//! the start of the next attempt, and deleted once an update fully succeeds.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::manifest::{DependencyGraph, ManifestError};

/// File name of the ledger inside the scratch cache directory.
pub const LEDGER_FILE: &str = "DownloadCache.cfg";

/// bundle name → content hash of the last completed download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadLedger {
    entries: BTreeMap<String, String>,
}

impl DownloadLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the ledger.
    ///
    /// A missing file is an empty ledger. A malformed file is logged and also
    /// treated as empty: losing the ledger only costs re-downloads.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read download ledger");
                return Self::new();
            }
        };

        match serde_json::from_str::<BTreeMap<String, String>>(&text) {
            Ok(entries) => Self { entries },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding malformed download ledger");
                Self::new()
            }
        }
    }

    /// Persist the ledger.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let text = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| ManifestError::Encode(e.to_string()))?;
        crate::manifest::write_file(path, text.as_bytes())
    }

    /// Remove the ledger file. A missing file is not an error.
    pub fn delete_file(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Record a completed download.
    pub fn record(&mut self, name: impl Into<String>, hash: impl Into<String>) {
        self.entries.insert(name.into(), hash.into());
    }

    /// Recorded hash for a bundle.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Forget a bundle.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name)
    }

    /// Whether the recorded hash for `name` equals `hash`.
    pub fn is_fresh(&self, name: &str, hash: &str) -> bool {
        self.get(name) == Some(hash)
    }

    /// Drop entries the new graph no longer vouches for.
    ///
    /// Returns the number of entries removed.
    pub fn prune_against(&mut self, graph: &DependencyGraph) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|name, hash| graph.hash(name) == Some(hash.as_str()));
        before - self.entries.len()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_fresh() {
        let mut ledger = DownloadLedger::new();
        ledger.record("a", "h1");

        assert!(ledger.is_fresh("a", "h1"));
        assert!(!ledger.is_fresh("a", "h2"));
        assert!(!ledger.is_fresh("b", "h1"));
    }

    #[test]
    fn test_save_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Cache").join(LEDGER_FILE);

        let mut ledger = DownloadLedger::new();
        ledger.record("a", "h1");
        ledger.record("b", "h2");
        ledger.save(&path).unwrap();

        assert_eq!(DownloadLedger::load(&path), ledger);
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(LEDGER_FILE);

        assert!(DownloadLedger::load(&path).is_empty());

        fs::write(&path, "not json").unwrap();
        assert!(DownloadLedger::load(&path).is_empty());
    }

    #[test]
    fn test_prune_against_graph() {
        let graph = DependencyGraph::new()
            .with_bundle("kept", "h1", Vec::<String>::new())
            .with_bundle("changed", "new", Vec::<String>::new());

        let mut ledger = DownloadLedger::new();
        ledger.record("kept", "h1");
        ledger.record("changed", "old");
        ledger.record("gone", "h3");

        assert_eq!(ledger.prune_against(&graph), 2);
        assert_eq!(ledger.iter().collect::<Vec<_>>(), vec![("kept", "h1")]);
    }

    #[test]
    fn test_delete_file_missing_ok() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(LEDGER_FILE);
        assert!(DownloadLedger::delete_file(&path).is_ok());

        fs::write(&path, "{}").unwrap();
        DownloadLedger::delete_file(&path).unwrap();
        assert!(!path.exists());
    }
}
