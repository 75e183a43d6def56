//! Update command - run the update pipeline with a progress bar.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bundlesync::codec::GzipCodec;
use bundlesync::config::{ConfigFile, SyncConfig};
use bundlesync::update::{UpdateState, UpdateStateMachine};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use super::common::transport_for;
use crate::error::CliError;

/// Interval between pipeline polls.
const TICK: Duration = Duration::from_millis(50);

/// Progress bar resolution.
const BAR_LENGTH: u64 = 1000;

const BAR_TEMPLATE: &str =
    "{spinner:.blue} {prefix:>18.cyan.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {percent:>3}%";

/// Arguments for the update command.
pub struct UpdateArgs {
    pub urls: Vec<String>,
    pub root: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub allow_downgrade: bool,
}

/// Merge CLI overrides into the configured settings.
fn resolve(config: &ConfigFile, args: UpdateArgs) -> SyncConfig {
    let mut sync = config.to_sync_config();
    if !args.urls.is_empty() {
        sync = sync.with_urls(args.urls);
    }
    if let Some(root) = args.root {
        sync.root_dir = root;
    }
    if let Some(count) = args.concurrency {
        sync = sync.with_max_concurrent_downloads(count);
    }
    if args.allow_downgrade {
        sync = sync.with_allow_downgrade(true);
    }
    sync
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(BAR_LENGTH);
    match ProgressStyle::with_template(BAR_TEMPLATE) {
        Ok(style) => bar.with_style(style.progress_chars("█▓▒░  ")),
        Err(_) => bar,
    }
}

/// Run the update command.
pub fn run(config: &ConfigFile, args: UpdateArgs) -> Result<(), CliError> {
    let sync = resolve(config, args);
    if sync.urls.is_empty() {
        return Err(CliError::Config(
            "No update URLs configured. Use --url or set sync.urls in config.ini".to_string(),
        ));
    }

    println!("Root: {}", sync.root_dir.display());
    for url in &sync.urls {
        println!("URL:  {}", url);
    }
    println!();

    let transport = transport_for(&sync)?;
    let mut update = UpdateStateMachine::new(sync, transport, Arc::new(GzipCodec::new()));

    // First Ctrl+C finishes the bundles in flight, the second stops at once.
    let handle = update.handle();
    let presses = Arc::new(AtomicUsize::new(0));
    ctrlc::set_handler(move || match presses.fetch_add(1, Ordering::SeqCst) {
        0 => {
            eprintln!();
            eprintln!("Cancelling after the current downloads (Ctrl+C again to abort)...");
            handle.cancel();
        }
        _ => handle.abort(),
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let bar = progress_bar();
    let status = loop {
        let status = update.poll();
        bar.set_position((status.progress * BAR_LENGTH as f64) as u64);
        bar.set_prefix(status.state.name());
        bar.tick();
        if status.is_done() {
            break status;
        }
        thread::sleep(TICK);
    };

    match status.state {
        UpdateState::Completed => {
            bar.finish_and_clear();
            println!("{}", style("Update complete.").green().bold());
            Ok(())
        }
        UpdateState::Failed => {
            bar.abandon();
            let code = status
                .error_code
                .unwrap_or(bundlesync::ErrorCode::PreprocessError);
            Err(CliError::Update {
                code,
                message: update.error_message().unwrap_or_default().to_string(),
            })
        }
        state => {
            bar.abandon();
            println!(
                "{}",
                style("Progress was saved; the next update resumes where this one stopped.")
                    .yellow()
            );
            Err(CliError::Interrupted(state))
        }
    }
}
