//! The resources manifest: versioned bundle descriptors with lookup indexes.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::descriptor::BundleDescriptor;
use super::{read_file, write_file, ManifestError};
use crate::version::ManifestVersion;

/// On-disk shape of the resources manifest.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ResourcesDocument {
    version: ManifestVersion,
    #[serde(default)]
    bundles: Vec<BundleDescriptor>,
}

/// Versioned set of bundle descriptors.
///
/// Lookup tables are built once when the manifest is constructed:
/// - name → descriptor
/// - scene → bundle name
/// - asset path → bundle names (inverted index)
#[derive(Debug, Clone, Default)]
pub struct ResourcesManifest {
    version: ManifestVersion,
    bundles: Vec<BundleDescriptor>,
    by_name: HashMap<String, usize>,
    scenes: HashMap<String, String>,
    assets: HashMap<String, BTreeSet<String>>,
}

impl ResourcesManifest {
    /// Build a manifest from descriptors.
    ///
    /// A later descriptor with the same name replaces an earlier one.
    pub fn new(version: impl Into<ManifestVersion>, bundles: Vec<BundleDescriptor>) -> Self {
        let mut deduped: Vec<BundleDescriptor> = Vec::with_capacity(bundles.len());
        let mut by_name = HashMap::with_capacity(bundles.len());

        for desc in bundles {
            match by_name.get(&desc.name) {
                Some(&idx) => deduped[idx] = desc,
                None => {
                    by_name.insert(desc.name.clone(), deduped.len());
                    deduped.push(desc);
                }
            }
        }

        let mut scenes = HashMap::new();
        let mut assets: HashMap<String, BTreeSet<String>> = HashMap::new();
        for desc in &deduped {
            for scene in &desc.scenes {
                scenes.insert(scene.clone(), desc.name.clone());
            }
            for asset in &desc.assets {
                assets
                    .entry(asset.clone())
                    .or_default()
                    .insert(desc.name.clone());
            }
        }

        Self {
            version: version.into(),
            bundles: deduped,
            by_name,
            scenes,
            assets,
        }
    }

    /// Parse a manifest from its JSON text.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ManifestError> {
        let doc: ResourcesDocument =
            serde_json::from_str(text).map_err(|e| ManifestError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        for desc in &doc.bundles {
            desc.validate().map_err(|reason| ManifestError::Parse {
                path: path.to_path_buf(),
                reason,
            })?;
        }

        Ok(Self::new(doc.version, doc.bundles))
    }

    /// Load a manifest from disk.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = read_file(path)?;
        let text = String::from_utf8(bytes).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    /// Serialize to pretty-printed JSON in descriptor order.
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            version: &'a ManifestVersion,
            bundles: &'a [BundleDescriptor],
        }

        // Plain data with string keys only.
        serde_json::to_string_pretty(&Borrowed {
            version: &self.version,
            bundles: &self.bundles,
        })
        .unwrap_or_default()
    }

    /// Write the manifest to disk.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        write_file(path, self.to_json().as_bytes())
    }

    /// Manifest version.
    pub fn version(&self) -> &ManifestVersion {
        &self.version
    }

    /// All descriptors in manifest order.
    pub fn bundles(&self) -> &[BundleDescriptor] {
        &self.bundles
    }

    /// Number of bundles.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Whether the manifest describes no bundles.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Look up a descriptor by bundle name.
    pub fn get(&self, name: &str) -> Option<&BundleDescriptor> {
        self.by_name.get(name).map(|&idx| &self.bundles[idx])
    }

    /// Whether a bundle is described.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Bundles that contain the given asset path.
    pub fn find_bundles_containing(&self, asset_path: &str) -> BTreeSet<&str> {
        self.assets
            .get(asset_path)
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// The bundle holding a scene.
    pub fn bundle_for_scene(&self, scene: &str) -> Option<&str> {
        self.scenes.get(scene).map(String::as_str)
    }

    /// Whether a bundle stays resident. Unknown names are not permanent.
    pub fn is_permanent(&self, name: &str) -> bool {
        self.get(name).map(|d| d.flags.permanent).unwrap_or(false)
    }

    /// Whether a bundle ships in the install package. Unknown names are not native.
    pub fn is_native(&self, name: &str) -> bool {
        self.get(name).map(|d| d.flags.native).unwrap_or(false)
    }

    /// Names of native bundles.
    pub fn native_bundles(&self) -> impl Iterator<Item = &str> {
        self.bundles
            .iter()
            .filter(|d| d.flags.native)
            .map(|d| d.name.as_str())
    }

    /// Names of bundles loaded at cache launch.
    pub fn startup_bundles(&self) -> impl Iterator<Item = &str> {
        self.bundles
            .iter()
            .filter(|d| d.flags.startup_load)
            .map(|d| d.name.as_str())
    }
}
