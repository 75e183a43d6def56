//! Common utilities shared across CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bundlesync::config::{ConfigFile, SyncConfig};
use bundlesync::transfer::{DirectoryTransport, HttpTransport, Transport};
use bundlesync::SyncError;

use crate::error::CliError;

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<ConfigFile, CliError> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    Ok(ConfigFile::load_from(path)?)
}

/// Bundle root: CLI takes precedence, then config.
pub fn resolve_root(cli_root: Option<PathBuf>, config: &ConfigFile) -> PathBuf {
    cli_root.unwrap_or_else(|| config.to_sync_config().root_dir)
}

fn is_http(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Pick a transport for the candidate URLs.
///
/// HTTP(S) URLs use the blocking HTTP client; anything else is treated as a
/// local mirror directory. Mixing the two is rejected.
pub fn transport_for(config: &SyncConfig) -> Result<Arc<dyn Transport>, CliError> {
    let http = config.urls.iter().filter(|url| is_http(url)).count();
    if http == 0 {
        return Ok(Arc::new(DirectoryTransport::new()));
    }
    if http != config.urls.len() {
        return Err(CliError::Config(
            "Cannot mix HTTP and directory URLs in one update".to_string(),
        ));
    }
    let transport =
        HttpTransport::with_timeout(config.transfer_timeout).map_err(SyncError::from)?;
    Ok(Arc::new(transport))
}

/// Format a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
