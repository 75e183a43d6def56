//! Init command - initialize configuration file.

use std::path::{Path, PathBuf};

use bundlesync::config::{default_root_dir, ConfigFile};

use crate::error::CliError;

/// Run the init command.
pub fn run(
    path: &Path,
    urls: Vec<String>,
    root: Option<PathBuf>,
    force: bool,
) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists. Use --force to overwrite it.",
            path.display()
        )));
    }

    let mut config = ConfigFile::default();
    config.sync.root_dir = Some(root.unwrap_or_else(default_root_dir));
    config.sync.urls = urls;
    config.save_to(path)?;

    println!("Configuration file: {}", path.display());
    if config.sync.urls.is_empty() {
        println!();
        println!("No update URLs configured yet. Add one with:");
        println!("  bundlesync config set sync.urls https://cdn.example.com/bundles");
    }
    println!();
    println!("CLI arguments override config file values when specified.");
    Ok(())
}
