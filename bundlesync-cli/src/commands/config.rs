//! Configuration management CLI commands.
//!
//! Provides `config get`, `config set`, `config list`, and `config path` commands
//! for viewing and modifying configuration settings from the command line.

use std::path::Path;

use bundlesync::config::{ConfigFile, ConfigKey};
use clap::Subcommand;

use super::common::load_config;
use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Get a configuration value
    Get {
        /// Configuration key in format section.key (e.g., sync.urls)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key in format section.key (e.g., sync.urls)
        key: String,

        /// Value to set
        value: String,
    },

    /// List all configuration settings
    List,

    /// Show the configuration file path
    Path,
}

/// Run a config subcommand against the file at `path`.
pub fn run(command: ConfigCommands, path: &Path) -> Result<(), CliError> {
    match command {
        ConfigCommands::Get { key } => run_get(path, &key),
        ConfigCommands::Set { key, value } => run_set(path, &key, &value),
        ConfigCommands::List => run_list(path),
        ConfigCommands::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn parse_key(key: &str) -> Result<ConfigKey, CliError> {
    key.parse().map_err(|_| {
        CliError::Config(format!(
            "Unknown configuration key '{}'. Use 'bundlesync config list' to see available keys.",
            key
        ))
    })
}

/// Get a configuration value.
fn run_get(path: &Path, key: &str) -> Result<(), CliError> {
    let config_key = parse_key(key)?;
    let config = load_config(path)?;
    let value = config_key.get(&config);

    if value.is_empty() {
        println!("(not set)");
    } else {
        println!("{}", value);
    }

    Ok(())
}

/// Set a configuration value.
fn run_set(path: &Path, key: &str, value: &str) -> Result<(), CliError> {
    let config_key = parse_key(key)?;

    let mut config = load_config(path)?;
    config_key.set(&mut config, value)?;
    config.save_to(path)?;

    println!("Set {} = {}", config_key.name(), value);

    Ok(())
}

/// List all configuration settings.
fn run_list(path: &Path) -> Result<(), CliError> {
    let config = load_config(path)?;

    println!("Configuration Settings");
    println!("======================");
    println!();

    print_settings(&config);

    if !config.files.is_empty() {
        println!();
        println!("[files]");
        for spec in &config.files {
            let kind = if spec.required { "required" } else { "optional" };
            println!("  {} = {}", spec.name, kind);
        }
    }

    Ok(())
}

fn print_settings(config: &ConfigFile) {
    let mut current_section = "";

    for key in ConfigKey::all() {
        let section = key.section();

        if section != current_section {
            if !current_section.is_empty() {
                println!();
            }
            println!("[{}]", section);
            current_section = section;
        }

        let value = key.get(config);
        if value.is_empty() {
            println!("  {} = (not set)", key.key_name());
        } else {
            println!("  {} = {}", key.key_name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_then_get_round_trips_through_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.ini");

        run(
            ConfigCommands::Set {
                key: "sync.max_concurrent_downloads".to_string(),
                value: "4".to_string(),
            },
            &path,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.sync.max_concurrent_downloads, 4);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let temp = TempDir::new().unwrap();
        let err = run(
            ConfigCommands::Get {
                key: "sync.nope".to_string(),
            },
            &temp.path().join("config.ini"),
        )
        .unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn test_invalid_value_not_saved() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");

        let result = run(
            ConfigCommands::Set {
                key: "sync.probe_timeout_secs".to_string(),
                value: "soon".to_string(),
            },
            &path,
        );
        assert!(result.is_err());
        assert!(!path.exists());
    }
}
