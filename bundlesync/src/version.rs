//! Manifest version tokens.
//!
//! Versions are dotted strings compared component by component. Unlike
//! semantic versioning there is no pre-release or build metadata: every
//! component is an unsigned number, and a version that is a strict prefix of
//! another sorts before it.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Compare two dotted version strings.
///
/// Components are split on `.` and compared numerically. Components that do
/// not parse as numbers count as `0`. When all shared components are equal,
/// the version with fewer components is older, so `"1.2" < "1.2.0"` and the
/// empty string is older than anything with at least one component.
///
/// # Example
///
/// ```
/// use std::cmp::Ordering;
/// use bundlesync::version::compare_version;
///
/// assert_eq!(compare_version("1.10", "1.9"), Ordering::Greater);
/// assert_eq!(compare_version("1.2", "1.2.0"), Ordering::Less);
/// assert_eq!(compare_version("", "1.0"), Ordering::Less);
/// ```
pub fn compare_version(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);

    for (l, r) in left.iter().zip(right.iter()) {
        match l.cmp(r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    left.len().cmp(&right.len())
}

fn components(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed
        .split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

/// A manifest version token ordered by [`compare_version`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestVersion(String);

impl ManifestVersion {
    /// Wrap a version token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether no version was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl PartialEq for ManifestVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ManifestVersion {}

impl PartialOrd for ManifestVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ManifestVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_version(&self.0, &other.0)
    }
}

impl fmt::Display for ManifestVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ManifestVersion {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}
