//! Tracing subscriber setup for hosts.
//!
//! Events go to stderr with local-time timestamps. When a log file is
//! configured a second, non-blocking layer writes plain text to it. `RUST_LOG`
//! overrides the configured level.

use std::path::PathBuf;

use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ConfigError;

/// Default filter directive.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Logging settings (the `[logging]` section of the config file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `bundlesync=debug`.
    pub level: String,
    /// Optional log file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

/// Keeps the file writer flushing. Drop it last.
#[must_use = "dropping the guard stops the log file writer"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Fails if the level is not a valid filter, the log file cannot be placed,
/// or a subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard, ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| ConfigError::InvalidValue {
            key: "logging.level".to_string(),
            value: config.level.clone(),
            reason: e.to_string(),
        })?,
    };

    // The local offset is unavailable in some multi-threaded contexts.
    let timer = OffsetTime::local_rfc_3339().unwrap_or_else(|_| OffsetTime::new(UtcOffset::UTC, Rfc3339));

    let stderr_layer = fmt::layer()
        .with_timer(timer.clone())
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path.file_name().ok_or_else(|| ConfigError::InvalidValue {
                key: "logging.file".to_string(),
                value: path.display().to_string(),
                reason: "not a file path".to_string(),
            })?;
            std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Write {
                path: dir.clone(),
                source: e,
            })?;

            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_timer(timer)
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(LoggingGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.file.is_none());
    }
}
