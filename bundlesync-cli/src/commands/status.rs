//! Status command - report on the installed bundle set.

use std::path::PathBuf;

use bundlesync::SyncError;
use bundlesync::bundle::{BundleLocator, LayeredLocator, PersistentLocator};
use bundlesync::config::ConfigFile;
use bundlesync::download::verify_checksum;
use bundlesync::ledger::DownloadLedger;
use bundlesync::manifest::ManifestStore;
use console::style;

use crate::error::CliError;

/// Run the status command.
pub fn run(config: &ConfigFile, root: Option<PathBuf>, verify: bool) -> Result<(), CliError> {
    let mut sync = config.to_sync_config();
    if let Some(root) = root {
        sync.root_dir = root;
    }

    let store = ManifestStore::load_or_empty(&sync.root_dir, &sync.manifest_paths)
        .map_err(SyncError::from)?;

    println!("Root:     {}", sync.root_dir.display());
    if let Some(install) = &sync.install_dir {
        println!("Install:  {}", install.display());
    }
    if store.version().is_empty() {
        println!("Version:  (nothing installed)");
    } else {
        println!("Version:  {}", store.version());
    }
    println!("Bundles:  {}", store.resources().len());
    println!("Servers:  {}", sync.urls.len());
    for url in &sync.urls {
        println!("  {}", url);
    }

    let ledger = DownloadLedger::load(&sync.ledger_path());
    if !ledger.is_empty() {
        println!();
        println!(
            "{} interrupted update: {} bundle(s) will be skipped on the next run",
            style("Resumable").yellow(),
            ledger.len()
        );
    }

    let locator: Box<dyn BundleLocator> = match &sync.install_dir {
        Some(install) => Box::new(LayeredLocator::new(&sync.root_dir, install)),
        None => Box::new(PersistentLocator::new(&sync.root_dir)),
    };

    let mut problems = 0;
    for desc in store.resources().bundles() {
        let Some(path) = locator.locate(&desc.name) else {
            if desc.flags.native {
                println!("  {} {} (missing)", style("!").red(), desc.name);
                problems += 1;
            }
            continue;
        };
        if !verify {
            continue;
        }
        if let Some(expected) = &desc.checksum {
            if let Err(e) = verify_checksum(&path, expected) {
                println!("  {} {} ({})", style("!").red(), desc.name, e);
                problems += 1;
            }
        }
    }

    println!();
    if problems > 0 {
        return Err(CliError::Verify(problems));
    }
    println!("{}", style("OK").green());
    Ok(())
}
