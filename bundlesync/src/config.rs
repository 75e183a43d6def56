//! Configuration for the synchronization pipeline.
//!
//! Two layers:
//!
//! - [`SyncConfig`]: the in-memory settings consumed by the update pipeline,
//!   built with `with_*` methods.
//! - [`ConfigFile`]: the INI file a host reads at startup and edits through
//!   [`ConfigKey`]. It converts into a [`SyncConfig`].
//!
//! ```ini
//! [sync]
//! root_dir = /var/lib/game/bundles
//! urls = https://cdn-a.example.com/v2, https://cdn-b.example.com/v2
//! probe_timeout_secs = 5
//! max_concurrent_downloads = 2
//!
//! [files]
//! Localization.json = optional
//!
//! [logging]
//! level = info
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::download::DEFAULT_CONCURRENCY;
use crate::ledger::LEDGER_FILE;
use crate::logging::{LogConfig, DEFAULT_LOG_LEVEL};
use crate::manifest::{ManifestPaths, DEFAULT_GRAPH_FILE, DEFAULT_RESOURCES_FILE};
use crate::update::StageWeights;

/// Name of the scratch directory below the root.
pub const CACHE_DIR_NAME: &str = "Cache";

/// Default timeout for URL probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single transfer.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

const SECTION_SYNC: &str = "sync";
const SECTION_FILES: &str = "files";
const SECTION_LOGGING: &str = "logging";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read { path: PathBuf, source: ini::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

/// A file fetched by the config stage and promoted into the root on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFileSpec {
    /// File name relative to the base URL and the root directory.
    pub name: String,
    /// Whether a failed fetch or promotion fails the update.
    pub required: bool,
}

impl ConfigFileSpec {
    /// A file the update cannot proceed without.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    /// A file whose absence is tolerated.
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// Settings for one update pipeline.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Persistent bundle root holding live manifests and bundle files.
    pub root_dir: PathBuf,
    /// Read-only install package directory with native bundles.
    pub install_dir: Option<PathBuf>,
    /// Candidate base URLs, probed in order.
    pub urls: Vec<String>,
    pub probe_timeout: Duration,
    pub transfer_timeout: Duration,
    pub max_concurrent_downloads: usize,
    pub manifest_paths: ManifestPaths,
    /// Files fetched into the scratch cache. The two manifests come first.
    pub config_files: Vec<ConfigFileSpec>,
    pub stage_weights: StageWeights,
    /// Accept a remote manifest older than the live one.
    pub allow_downgrade: bool,
}

impl SyncConfig {
    /// Create a configuration with defaults for everything but the root.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        let manifest_paths = ManifestPaths::default();
        Self {
            root_dir: root_dir.into(),
            install_dir: None,
            urls: Vec::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            max_concurrent_downloads: DEFAULT_CONCURRENCY,
            config_files: manifest_specs(&manifest_paths),
            manifest_paths,
            stage_weights: StageWeights::default(),
            allow_downgrade: false,
        }
    }

    /// Set the install package directory.
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    /// Append a candidate base URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    /// Replace the candidate base URLs.
    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_downloads(mut self, count: usize) -> Self {
        self.max_concurrent_downloads = count.max(1);
        self
    }

    /// Use different manifest file names. The required manifest entries of
    /// `config_files` follow; extra files are kept.
    pub fn with_manifest_paths(mut self, paths: ManifestPaths) -> Self {
        let old = self.manifest_paths.file_names().map(str::to_string);
        let extras: Vec<ConfigFileSpec> = self
            .config_files
            .into_iter()
            .filter(|spec| !old.contains(&spec.name))
            .collect();

        self.config_files = manifest_specs(&paths);
        self.config_files.extend(extras);
        self.manifest_paths = paths;
        self
    }

    /// Fetch and promote an additional file.
    pub fn with_config_file(mut self, spec: ConfigFileSpec) -> Self {
        self.config_files.retain(|s| s.name != spec.name);
        self.config_files.push(spec);
        self
    }

    pub fn with_stage_weights(mut self, weights: StageWeights) -> Self {
        self.stage_weights = weights;
        self
    }

    pub fn with_allow_downgrade(mut self, allow: bool) -> Self {
        self.allow_downgrade = allow;
        self
    }

    /// Scratch directory for in-progress config downloads.
    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join(CACHE_DIR_NAME)
    }

    /// Location of the resume ledger.
    pub fn ledger_path(&self) -> PathBuf {
        self.cache_dir().join(LEDGER_FILE)
    }

    /// Check settings the pipeline cannot work around.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root directory is empty".to_string()));
        }
        if !self.stage_weights.is_valid() {
            return Err(ConfigError::Invalid(
                "stage weights must be non-negative with a positive sum".to_string(),
            ));
        }
        for name in self.manifest_paths.file_names() {
            if !self.config_files.iter().any(|s| s.name == name && s.required) {
                return Err(ConfigError::Invalid(format!(
                    "manifest {} must be a required config file",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn manifest_specs(paths: &ManifestPaths) -> Vec<ConfigFileSpec> {
    paths
        .file_names()
        .iter()
        .map(|name| ConfigFileSpec::required(*name))
        .collect()
}

/// `[sync]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub root_dir: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub urls: Vec<String>,
    pub probe_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub max_concurrent_downloads: usize,
    pub allow_downgrade: bool,
    pub graph_file: String,
    pub resources_file: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            root_dir: None,
            install_dir: None,
            urls: Vec::new(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT.as_secs(),
            transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT.as_secs(),
            max_concurrent_downloads: DEFAULT_CONCURRENCY,
            allow_downgrade: false,
            graph_file: DEFAULT_GRAPH_FILE.to_string(),
            resources_file: DEFAULT_RESOURCES_FILE.to_string(),
        }
    }
}

/// The INI configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub sync: SyncSettings,
    /// Extra files from the `[files]` section.
    pub files: Vec<ConfigFileSpec>,
    pub logging: LogConfig,
}

/// Default config file location under the platform config directory.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bundlesync")
        .join("config.ini")
}

/// Default bundle root under the platform data directory.
pub fn default_root_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bundlesync")
}

impl ConfigFile {
    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    /// Load from a path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_ini(&ini)
    }

    /// Parse INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_ini(&ini)
    }

    /// Save to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_file_path())
    }

    /// Save to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        self.to_ini()
            .write_to_file(path)
            .map_err(|e| ConfigError::Write {
                path: path.to_path_buf(),
                source: e,
            })
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = ConfigFile::default();

        if let Some(section) = ini.section(Some(SECTION_SYNC)) {
            for (key, value) in section.iter() {
                match format!("{}.{}", SECTION_SYNC, key).parse::<ConfigKey>() {
                    Ok(config_key) => config_key.set(&mut config, value)?,
                    Err(_) => tracing::warn!(key, "Ignoring unknown [sync] key"),
                }
            }
        }

        if let Some(section) = ini.section(Some(SECTION_FILES)) {
            for (name, value) in section.iter() {
                let required = match value.trim() {
                    "required" => true,
                    "optional" => false,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: format!("{}.{}", SECTION_FILES, name),
                            value: other.to_string(),
                            reason: "expected 'required' or 'optional'".to_string(),
                        })
                    }
                };
                config.files.push(ConfigFileSpec {
                    name: name.to_string(),
                    required,
                });
            }
        }

        if let Some(section) = ini.section(Some(SECTION_LOGGING)) {
            for (key, value) in section.iter() {
                match format!("{}.{}", SECTION_LOGGING, key).parse::<ConfigKey>() {
                    Ok(config_key) => config_key.set(&mut config, value)?,
                    Err(_) => tracing::warn!(key, "Ignoring unknown [logging] key"),
                }
            }
        }

        Ok(config)
    }

    fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        for key in ConfigKey::all() {
            let value = key.get(self);
            if !value.is_empty() {
                ini.with_section(Some(key.section())).set(key.key_name(), value);
            }
        }
        for spec in &self.files {
            let value = if spec.required { "required" } else { "optional" };
            ini.with_section(Some(SECTION_FILES))
                .set(spec.name.as_str(), value);
        }
        ini
    }

    /// Build the pipeline settings.
    pub fn to_sync_config(&self) -> SyncConfig {
        let s = &self.sync;
        let mut config = SyncConfig::new(s.root_dir.clone().unwrap_or_else(default_root_dir))
            .with_urls(s.urls.iter().cloned())
            .with_probe_timeout(Duration::from_secs(s.probe_timeout_secs))
            .with_transfer_timeout(Duration::from_secs(s.transfer_timeout_secs))
            .with_max_concurrent_downloads(s.max_concurrent_downloads)
            .with_allow_downgrade(s.allow_downgrade)
            .with_manifest_paths(ManifestPaths {
                graph_file: s.graph_file.clone(),
                resources_file: s.resources_file.clone(),
            });
        if let Some(dir) = &s.install_dir {
            config = config.with_install_dir(dir.clone());
        }
        for spec in &self.files {
            config = config.with_config_file(spec.clone());
        }
        config
    }
}

/// Keys addressable as `section.key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    SyncRootDir,
    SyncInstallDir,
    SyncUrls,
    SyncProbeTimeoutSecs,
    SyncTransferTimeoutSecs,
    SyncMaxConcurrentDownloads,
    SyncAllowDowngrade,
    SyncGraphFile,
    SyncResourcesFile,
    LoggingLevel,
    LoggingFile,
}

impl ConfigKey {
    /// Every key, grouped by section.
    pub fn all() -> &'static [ConfigKey] {
        &[
            ConfigKey::SyncRootDir,
            ConfigKey::SyncInstallDir,
            ConfigKey::SyncUrls,
            ConfigKey::SyncProbeTimeoutSecs,
            ConfigKey::SyncTransferTimeoutSecs,
            ConfigKey::SyncMaxConcurrentDownloads,
            ConfigKey::SyncAllowDowngrade,
            ConfigKey::SyncGraphFile,
            ConfigKey::SyncResourcesFile,
            ConfigKey::LoggingLevel,
            ConfigKey::LoggingFile,
        ]
    }

    /// INI section.
    pub fn section(&self) -> &'static str {
        match self {
            ConfigKey::LoggingLevel | ConfigKey::LoggingFile => SECTION_LOGGING,
            _ => SECTION_SYNC,
        }
    }

    /// Key within the section.
    pub fn key_name(&self) -> &'static str {
        match self {
            ConfigKey::SyncRootDir => "root_dir",
            ConfigKey::SyncInstallDir => "install_dir",
            ConfigKey::SyncUrls => "urls",
            ConfigKey::SyncProbeTimeoutSecs => "probe_timeout_secs",
            ConfigKey::SyncTransferTimeoutSecs => "transfer_timeout_secs",
            ConfigKey::SyncMaxConcurrentDownloads => "max_concurrent_downloads",
            ConfigKey::SyncAllowDowngrade => "allow_downgrade",
            ConfigKey::SyncGraphFile => "graph_file",
            ConfigKey::SyncResourcesFile => "resources_file",
            ConfigKey::LoggingLevel => "level",
            ConfigKey::LoggingFile => "file",
        }
    }

    /// Full `section.key` name.
    pub fn name(&self) -> String {
        format!("{}.{}", self.section(), self.key_name())
    }

    /// Current value as text; empty when unset.
    pub fn get(&self, config: &ConfigFile) -> String {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        let s = &config.sync;
        match self {
            ConfigKey::SyncRootDir => path(&s.root_dir),
            ConfigKey::SyncInstallDir => path(&s.install_dir),
            ConfigKey::SyncUrls => s.urls.join(", "),
            ConfigKey::SyncProbeTimeoutSecs => s.probe_timeout_secs.to_string(),
            ConfigKey::SyncTransferTimeoutSecs => s.transfer_timeout_secs.to_string(),
            ConfigKey::SyncMaxConcurrentDownloads => s.max_concurrent_downloads.to_string(),
            ConfigKey::SyncAllowDowngrade => s.allow_downgrade.to_string(),
            ConfigKey::SyncGraphFile => s.graph_file.clone(),
            ConfigKey::SyncResourcesFile => s.resources_file.clone(),
            ConfigKey::LoggingLevel => config.logging.level.clone(),
            ConfigKey::LoggingFile => path(&config.logging.file),
        }
    }

    /// Parse and store a value.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: self.name(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let optional_path = |v: &str| (!v.is_empty()).then(|| PathBuf::from(v));
        let s = &mut config.sync;

        match self {
            ConfigKey::SyncRootDir => s.root_dir = optional_path(value),
            ConfigKey::SyncInstallDir => s.install_dir = optional_path(value),
            ConfigKey::SyncUrls => {
                s.urls = value
                    .split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            ConfigKey::SyncProbeTimeoutSecs => {
                s.probe_timeout_secs = value.parse().map_err(|_| invalid("expected seconds"))?;
            }
            ConfigKey::SyncTransferTimeoutSecs => {
                s.transfer_timeout_secs = value.parse().map_err(|_| invalid("expected seconds"))?;
            }
            ConfigKey::SyncMaxConcurrentDownloads => {
                let count: usize = value.parse().map_err(|_| invalid("expected a count"))?;
                if count == 0 {
                    return Err(invalid("must be at least 1"));
                }
                s.max_concurrent_downloads = count;
            }
            ConfigKey::SyncAllowDowngrade => {
                s.allow_downgrade = value.parse().map_err(|_| invalid("expected true or false"))?;
            }
            ConfigKey::SyncGraphFile | ConfigKey::SyncResourcesFile if value.is_empty() => {
                return Err(invalid("file name cannot be empty"));
            }
            ConfigKey::SyncGraphFile => s.graph_file = value.to_string(),
            ConfigKey::SyncResourcesFile => s.resources_file = value.to_string(),
            ConfigKey::LoggingLevel => {
                config.logging.level = if value.is_empty() {
                    DEFAULT_LOG_LEVEL.to_string()
                } else {
                    value.to_string()
                };
            }
            ConfigKey::LoggingFile => config.logging.file = optional_path(value),
        }
        Ok(())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::all()
            .iter()
            .copied()
            .find(|key| key.name() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section(), self.key_name())
    }
}
