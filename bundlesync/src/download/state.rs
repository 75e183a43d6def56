//! Bookkeeping for a batch of bundle downloads.
//!
//! A bundle name lives in exactly one of the four lists at any time:
//!
//! ```text
//! uncomplete ──pop()──► downloading ──┬──► complete
//!   (LIFO)                            └──► failed
//! ```

use std::collections::BTreeSet;

use crate::error::ErrorCode;
use crate::manifest::BundleDescriptor;

/// A bundle waiting for a transfer slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBundle {
    /// Canonical bundle name.
    pub name: String,
    /// Name of the file on the server (the compressed artifact when compressed).
    pub remote_name: String,
    /// Bytes expected over the wire.
    pub transfer_size: u64,
    /// Expected SHA-256 of the installed file, if the manifest has one.
    pub checksum: Option<String>,
    /// Whether the remote file must be decompressed after the transfer.
    pub compressed: bool,
}

impl PendingBundle {
    /// Describe a bundle for transfer, using `compressed_name` to derive the
    /// remote artifact name of compressed bundles.
    pub fn from_descriptor(desc: &BundleDescriptor, compressed_name: impl Fn(&str) -> String) -> Self {
        let compressed = desc.flags.compressed;
        Self {
            name: desc.name.clone(),
            remote_name: if compressed {
                compressed_name(&desc.name)
            } else {
                desc.name.clone()
            },
            transfer_size: desc.transfer_size(),
            checksum: desc.checksum.clone(),
            compressed,
        }
    }
}

/// Mutable state of one download batch. Guarded by the downloader's mutex.
#[derive(Debug, Default)]
pub struct DownloadState {
    /// Waiting bundles; the next one is taken from the end.
    pub uncomplete: Vec<PendingBundle>,
    /// Names currently held by a slot.
    pub downloading: BTreeSet<String>,
    /// Names in completion order.
    pub complete: Vec<String>,
    /// Names whose transfer failed or was interrupted.
    pub failed: Vec<String>,
    /// First error observed.
    pub error_code: Option<ErrorCode>,
    /// Human-readable description of the first error.
    pub last_error: Option<String>,
    /// Sum of transfer sizes at start.
    pub total_size: u64,
    /// Stop pulling new work once the current transfers finish.
    pub cancel_requested: bool,
    /// Stop immediately.
    pub abort_requested: bool,
}

impl DownloadState {
    /// Create state for a batch.
    ///
    /// `bundles` are pushed in order, so the last one is transferred first.
    pub fn new(bundles: Vec<PendingBundle>) -> Self {
        let total_size = bundles.iter().map(|b| b.transfer_size).sum();
        Self {
            uncomplete: bundles,
            total_size,
            ..Self::default()
        }
    }

    /// Whether slots may take more work.
    pub fn accepting_work(&self) -> bool {
        self.error_code.is_none() && !self.cancel_requested && !self.abort_requested
    }

    /// Take the next bundle for a slot, LIFO.
    pub fn take_next(&mut self) -> Option<PendingBundle> {
        if !self.accepting_work() {
            return None;
        }
        let next = self.uncomplete.pop()?;
        self.downloading.insert(next.name.clone());
        Some(next)
    }

    /// Record a finished transfer.
    pub fn record_success(&mut self, name: &str) {
        self.downloading.remove(name);
        self.complete.push(name.to_string());
    }

    /// Record a failed transfer.
    ///
    /// Only the first error is kept. `code` is `None` for transfers that were
    /// interrupted by an abort rather than failing on their own.
    pub fn record_failure(&mut self, name: &str, code: Option<ErrorCode>, message: String) {
        self.downloading.remove(name);
        self.failed.push(name.to_string());
        if let (None, Some(code)) = (self.error_code, code) {
            self.error_code = Some(code);
            self.last_error = Some(message);
        }
    }

    /// Whether the batch has reached a terminal condition.
    pub fn is_done(&self) -> bool {
        if self.error_code.is_some() || self.abort_requested {
            return true;
        }
        if self.cancel_requested {
            return self.downloading.is_empty();
        }
        self.uncomplete.is_empty() && self.downloading.is_empty()
    }

    /// Whether every requested bundle was installed.
    pub fn is_complete(&self) -> bool {
        self.uncomplete.is_empty()
            && self.downloading.is_empty()
            && self.failed.is_empty()
            && self.error_code.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(name: &str, size: u64) -> PendingBundle {
        PendingBundle {
            name: name.to_string(),
            remote_name: name.to_string(),
            transfer_size: size,
            checksum: None,
            compressed: false,
        }
    }

    #[test]
    fn test_take_next_is_lifo() {
        let mut state = DownloadState::new(vec![pending("a", 1), pending("b", 2), pending("c", 3)]);
        assert_eq!(state.total_size, 6);

        assert_eq!(state.take_next().unwrap().name, "c");
        assert_eq!(state.take_next().unwrap().name, "b");
        assert!(state.downloading.contains("c"));
        assert!(state.downloading.contains("b"));
    }

    #[test]
    fn test_first_error_wins() {
        let mut state = DownloadState::new(vec![pending("a", 1), pending("b", 1)]);
        state.take_next();
        state.take_next();

        state.record_failure("b", Some(ErrorCode::DiskFull), "full".into());
        state.record_failure("a", Some(ErrorCode::DownloadFailed), "late".into());

        assert_eq!(state.error_code, Some(ErrorCode::DiskFull));
        assert_eq!(state.last_error.as_deref(), Some("full"));
        assert_eq!(state.failed, vec!["b", "a"]);
        assert!(state.is_done());
    }

    #[test]
    fn test_error_stops_taking_work() {
        let mut state = DownloadState::new(vec![pending("a", 1), pending("b", 1)]);
        state.take_next();
        state.record_failure("b", Some(ErrorCode::DownloadFailed), "boom".into());

        assert!(state.take_next().is_none());
        assert_eq!(state.uncomplete.len(), 1);
    }

    #[test]
    fn test_cancel_waits_for_in_flight() {
        let mut state = DownloadState::new(vec![pending("a", 1), pending("b", 1)]);
        state.take_next();
        state.cancel_requested = true;

        assert!(!state.is_done());
        assert!(state.take_next().is_none());

        state.record_success("b");
        assert!(state.is_done());
        assert!(!state.is_complete());
    }

    #[test]
    fn test_complete() {
        let mut state = DownloadState::new(vec![pending("a", 1)]);
        let next = state.take_next().unwrap();
        state.record_success(&next.name);

        assert!(state.is_done());
        assert!(state.is_complete());
        assert_eq!(state.complete, vec!["a"]);
    }

    #[test]
    fn test_from_descriptor_compressed() {
        let desc = BundleDescriptor::new("level1", 100).with_compressed_size(40);
        let bundle = PendingBundle::from_descriptor(&desc, |n| format!("{}.gz", n));

        assert_eq!(bundle.remote_name, "level1.gz");
        assert_eq!(bundle.transfer_size, 40);
        assert!(bundle.compressed);
    }
}
