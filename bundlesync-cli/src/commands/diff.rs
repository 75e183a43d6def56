//! Diff command - preview what an update between two manifest sets would do.

use std::path::{Path, PathBuf};

use bundlesync::SyncError;
use bundlesync::config::ConfigFile;
use bundlesync::diff::{DiffMode, DifferenceCalculator};
use bundlesync::manifest::ManifestStore;
use console::style;

use super::common::format_size;
use crate::error::CliError;

/// Run the diff command.
pub fn run(
    config: &ConfigFile,
    old: &Path,
    new: &Path,
    bundles: Option<PathBuf>,
    initial_only: bool,
) -> Result<(), CliError> {
    let paths = config.to_sync_config().manifest_paths;
    let old_store = ManifestStore::load_or_empty(old, &paths).map_err(SyncError::from)?;
    let new_store = ManifestStore::load(new, &paths).map_err(SyncError::from)?;

    let mode = if initial_only {
        DiffMode::OnlyInitial
    } else {
        DiffMode::All
    };
    let bundle_dir = bundles.unwrap_or_else(|| old.to_path_buf());
    let diff = DifferenceCalculator::new(&bundle_dir).diff(
        old_store.graph(),
        new_store.graph(),
        old_store.resources(),
        new_store.resources(),
        mode,
    );

    let old_version = if old_store.version().is_empty() {
        "(none)".to_string()
    } else {
        old_store.version().to_string()
    };
    println!("Version: {} -> {}", old_version, new_store.version());
    println!();

    if diff.is_empty() {
        println!("{}", style("Up to date.").green());
        return Ok(());
    }

    let mut transfer = 0u64;
    println!("Download ({}):", diff.download.len());
    for name in &diff.download {
        let size = new_store
            .resources()
            .get(name)
            .map(|d| d.transfer_size())
            .unwrap_or(0);
        transfer += size;
        println!("  {} {} ({})", style("+").green(), name, format_size(size));
    }
    println!();
    println!("Delete ({}):", diff.delete.len());
    for name in &diff.delete {
        println!("  {} {}", style("-").red(), name);
    }
    println!();
    println!("Total transfer: {}", format_size(transfer));

    Ok(())
}
