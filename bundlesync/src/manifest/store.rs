//! Paired dependency graph and resources manifest.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::graph::DependencyGraph;
use super::resources::ResourcesManifest;
use super::ManifestError;
use crate::version::ManifestVersion;

/// Default file name of the dependency graph.
pub const DEFAULT_GRAPH_FILE: &str = "BundleGraph.bin";

/// Default file name of the resources manifest.
pub const DEFAULT_RESOURCES_FILE: &str = "ResourcesManifest.json";

/// File names of the two manifests relative to a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPaths {
    /// Dependency graph file name.
    pub graph_file: String,
    /// Resources manifest file name.
    pub resources_file: String,
}

impl Default for ManifestPaths {
    fn default() -> Self {
        Self {
            graph_file: DEFAULT_GRAPH_FILE.to_string(),
            resources_file: DEFAULT_RESOURCES_FILE.to_string(),
        }
    }
}

impl ManifestPaths {
    /// Path of the dependency graph inside `dir`.
    pub fn graph_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.graph_file)
    }

    /// Path of the resources manifest inside `dir`.
    pub fn resources_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.resources_file)
    }

    /// Both file names, graph first.
    pub fn file_names(&self) -> [&str; 2] {
        [&self.graph_file, &self.resources_file]
    }
}

/// Owner of a loaded manifest pair.
#[derive(Debug, Clone, Default)]
pub struct ManifestStore {
    graph: DependencyGraph,
    resources: ResourcesManifest,
}

impl ManifestStore {
    /// Wrap an already-built manifest pair.
    pub fn new(graph: DependencyGraph, resources: ResourcesManifest) -> Self {
        Self { graph, resources }
    }

    /// Load both manifests from `dir`.
    ///
    /// A missing file yields [`ManifestError::NotFound`]; a malformed one
    /// yields [`ManifestError::Parse`].
    pub fn load(dir: &Path, paths: &ManifestPaths) -> Result<Self, ManifestError> {
        let graph = DependencyGraph::load(&paths.graph_path(dir))?;
        let resources = ResourcesManifest::load(&paths.resources_path(dir))?;
        tracing::debug!(
            dir = %dir.display(),
            version = %resources.version(),
            bundles = resources.len(),
            "Loaded manifests"
        );
        Ok(Self { graph, resources })
    }

    /// Load both manifests, treating absent files as empty.
    ///
    /// Used for the live side on first launch. Parse errors still fail.
    pub fn load_or_empty(dir: &Path, paths: &ManifestPaths) -> Result<Self, ManifestError> {
        let graph = match DependencyGraph::load(&paths.graph_path(dir)) {
            Ok(graph) => graph,
            Err(e) if e.is_not_found() => DependencyGraph::new(),
            Err(e) => return Err(e),
        };
        let resources = match ResourcesManifest::load(&paths.resources_path(dir)) {
            Ok(resources) => resources,
            Err(e) if e.is_not_found() => ResourcesManifest::default(),
            Err(e) => return Err(e),
        };
        Ok(Self { graph, resources })
    }

    /// Write both manifests into `dir`.
    pub fn save(&self, dir: &Path, paths: &ManifestPaths) -> Result<(), ManifestError> {
        self.graph.save(&paths.graph_path(dir))?;
        self.resources.save(&paths.resources_path(dir))
    }

    /// The dependency graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// The resources manifest.
    pub fn resources(&self) -> &ResourcesManifest {
        &self.resources
    }

    /// Resources manifest version.
    pub fn version(&self) -> &ManifestVersion {
        self.resources.version()
    }

    /// Bundles that contain an asset path.
    pub fn find_bundles_containing(&self, asset_path: &str) -> BTreeSet<&str> {
        self.resources.find_bundles_containing(asset_path)
    }

    /// Whether a bundle stays resident. False for unknown names.
    pub fn is_permanent(&self, name: &str) -> bool {
        self.resources.is_permanent(name)
    }

    /// Whether a bundle ships in the install package. False for unknown names.
    pub fn is_native(&self, name: &str) -> bool {
        self.resources.is_native(name)
    }

    /// The bundle holding a scene.
    pub fn bundle_for_scene(&self, scene: &str) -> Option<&str> {
        self.resources.bundle_for_scene(scene)
    }
}
