//! Bundle descriptors from the resources manifest.

use serde::{Deserialize, Serialize};

use super::is_safe_bundle_name;

/// Installation attributes of a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFlags {
    /// The bundle is stored compressed on the server.
    #[serde(default)]
    pub compressed: bool,
    /// The bundle ships inside the install package.
    #[serde(default)]
    pub native: bool,
    /// The bundle stays resident for the lifetime of the process.
    #[serde(default)]
    pub permanent: bool,
    /// The bundle is loaded when the cache launches.
    #[serde(default)]
    pub startup_load: bool,
}

/// Description of a single bundle.
///
/// Identity is the bundle name. `compressed_size` is non-zero exactly when
/// `flags.compressed` is set; [`BundleDescriptor::validate`] enforces this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    /// Unique bundle name, also its file name relative to the root directory.
    pub name: String,

    /// Asset paths contained in the bundle, in build order.
    #[serde(default)]
    pub assets: Vec<String>,

    /// Scene identifiers contained in the bundle.
    #[serde(default)]
    pub scenes: Vec<String>,

    /// Uncompressed size in bytes.
    #[serde(default)]
    pub size: u64,

    /// Compressed size in bytes, `0` when not compressed.
    #[serde(default)]
    pub compressed_size: u64,

    #[serde(flatten)]
    pub flags: BundleFlags,

    /// Lowercase hex SHA-256 of the installed (uncompressed) file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BundleDescriptor {
    /// Create an uncompressed descriptor with no assets.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            assets: Vec::new(),
            scenes: Vec::new(),
            size,
            compressed_size: 0,
            flags: BundleFlags::default(),
            checksum: None,
        }
    }

    /// Mark the bundle as stored compressed with the given size.
    pub fn with_compressed_size(mut self, compressed_size: u64) -> Self {
        self.compressed_size = compressed_size;
        self.flags.compressed = compressed_size > 0;
        self
    }

    /// Set the native flag.
    pub fn with_native(mut self, native: bool) -> Self {
        self.flags.native = native;
        self
    }

    /// Set the permanent flag.
    pub fn with_permanent(mut self, permanent: bool) -> Self {
        self.flags.permanent = permanent;
        self
    }

    /// Set the startup-load flag.
    pub fn with_startup_load(mut self, startup_load: bool) -> Self {
        self.flags.startup_load = startup_load;
        self
    }

    /// Add an asset path.
    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.assets.push(asset.into());
        self
    }

    /// Add a scene identifier.
    pub fn with_scene(mut self, scene: impl Into<String>) -> Self {
        self.scenes.push(scene.into());
        self
    }

    /// Set the expected SHA-256 of the installed file.
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Bytes that travel over the wire for this bundle.
    pub fn transfer_size(&self) -> u64 {
        if self.flags.compressed {
            self.compressed_size
        } else {
            self.size
        }
    }

    /// Check the compressed-size invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("bundle with empty name".to_string());
        }
        if !is_safe_bundle_name(&self.name) {
            return Err(format!("bundle name {:?} escapes the bundle directory", self.name));
        }
        if self.flags.compressed != (self.compressed_size > 0) {
            return Err(format!(
                "bundle {}: compressed flag is {} but compressed size is {}",
                self.name, self.flags.compressed, self.compressed_size
            ));
        }
        Ok(())
    }
}
