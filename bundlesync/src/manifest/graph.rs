//! Dependency graph manifest: direct dependencies and content hash per bundle.
//!
//! The graph is produced by build tooling and stored as an opaque binary
//! document. The runtime only reads it, except for tests and mirrors which
//! write it through [`DependencyGraph::save`].

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{is_safe_bundle_name, read_file, write_file, ManifestError};

/// Graph node for a single bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEntry {
    /// Content hash recorded by the build.
    pub hash: String,
    /// Direct dependencies, in build order.
    pub dependencies: Vec<String>,
}

/// Bundle → (hash, direct dependencies).
///
/// The build guarantees the graph is acyclic; traversals still keep a visited
/// set so a malformed graph cannot loop forever.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    bundles: BTreeMap<String, GraphEntry>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a bundle.
    pub fn insert<I, S>(&mut self, name: impl Into<String>, hash: impl Into<String>, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bundles.insert(
            name.into(),
            GraphEntry {
                hash: hash.into(),
                dependencies: deps.into_iter().map(Into::into).collect(),
            },
        );
    }

    /// Builder form of [`DependencyGraph::insert`].
    pub fn with_bundle<I, S>(mut self, name: &str, hash: &str, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(name, hash, deps);
        self
    }

    /// Decode a graph from its binary form.
    ///
    /// Bundle and dependency names that would escape the bundle directory are
    /// rejected.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self, ManifestError> {
        let graph: Self = bincode::deserialize(bytes).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let names = graph
            .bundles
            .iter()
            .flat_map(|(name, entry)| std::iter::once(name).chain(&entry.dependencies));
        for name in names {
            if !is_safe_bundle_name(name) {
                return Err(ManifestError::Parse {
                    path: path.to_path_buf(),
                    reason: format!("bundle name {:?} escapes the bundle directory", name),
                });
            }
        }
        Ok(graph)
    }

    /// Encode the graph.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        bincode::serialize(self).map_err(|e| ManifestError::Encode(e.to_string()))
    }

    /// Load a graph from disk.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = read_file(path)?;
        Self::from_bytes(&bytes, path)
    }

    /// Write the graph to disk.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        write_file(path, &self.to_bytes()?)
    }

    /// Whether the graph has an entry for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.bundles.contains_key(name)
    }

    /// Content hash of a bundle.
    pub fn hash(&self, name: &str) -> Option<&str> {
        self.bundles.get(name).map(|e| e.hash.as_str())
    }

    /// Direct dependencies of a bundle, empty for unknown names.
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.bundles
            .get(name)
            .map(|e| e.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// All bundle names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }

    /// Number of bundles.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Transitive dependency closure of `name`, dependencies first.
    ///
    /// The returned list ends with `name` itself. Each bundle appears once.
    /// Traversal is iterative; a cycle is cut at the first revisit.
    pub fn dependency_closure(&self, name: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        // (bundle, index of the next dependency to visit)
        let mut stack: Vec<(&str, usize)> = vec![(name, 0)];
        visited.insert(name);

        while let Some((current, next)) = stack.pop() {
            let deps = self.dependencies(current);
            if next < deps.len() {
                stack.push((current, next + 1));
                let dep = deps[next].as_str();
                if visited.insert(dep) {
                    stack.push((dep, 0));
                }
            } else {
                order.push(current.to_string());
            }
        }

        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn diamond() -> DependencyGraph {
        DependencyGraph::new()
            .with_bundle("base", "h0", Vec::<String>::new())
            .with_bundle("left", "h1", ["base"])
            .with_bundle("right", "h2", ["base"])
            .with_bundle("top", "h3", ["left", "right"])
    }

    #[test]
    fn test_closure_orders_dependencies_first() {
        let graph = diamond();
        let closure = graph.dependency_closure("top");

        assert_eq!(closure, vec!["base", "left", "right", "top"]);
    }

    #[test]
    fn test_closure_of_leaf() {
        let graph = diamond();
        assert_eq!(graph.dependency_closure("base"), vec!["base"]);
    }

    #[test]
    fn test_closure_terminates_on_cycle() {
        let graph = DependencyGraph::new()
            .with_bundle("a", "1", ["b"])
            .with_bundle("b", "2", ["a"]);

        let closure = graph.dependency_closure("a");
        assert_eq!(closure, vec!["b", "a"]);
    }

    #[test]
    fn test_closure_includes_unknown_dependency() {
        let graph = DependencyGraph::new().with_bundle("a", "1", ["ghost"]);
        assert_eq!(graph.dependency_closure("a"), vec!["ghost", "a"]);
    }

    #[test]
    fn test_binary_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("graph.bin");
        let graph = diamond();

        graph.save(&path).unwrap();
        let loaded = DependencyGraph::load(&path).unwrap();

        assert_eq!(loaded, graph);
        assert_eq!(loaded.hash("left"), Some("h1"));
        assert_eq!(loaded.dependencies("top"), &["left", "right"]);
    }

    #[test]
    fn test_escaping_names_are_parse_errors() {
        let escaping_bundle =
            DependencyGraph::new().with_bundle("../../victim", "h1", Vec::<String>::new());
        let escaping_dep = DependencyGraph::new().with_bundle("a", "h1", ["/tmp/victim"]);

        for graph in [escaping_bundle, escaping_dep] {
            let bytes = graph.to_bytes().unwrap();
            let err = DependencyGraph::from_bytes(&bytes, Path::new("g.bin")).unwrap_err();
            assert!(matches!(err, ManifestError::Parse { .. }));
        }
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = DependencyGraph::from_bytes(&[0xff, 0xff, 0xff], Path::new("g.bin")).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }
}
