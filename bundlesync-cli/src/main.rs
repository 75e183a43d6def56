//! bundlesync CLI - Command-line host for asset bundle updates
//!
//! Drives the update pipeline against a mirror or CDN, inspects manifest
//! differences and reports the state of the local bundle set.

mod commands;
mod error;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use bundlesync::logging::init_logging;
use commands::config::ConfigCommands;
use commands::update::UpdateArgs;
use error::CliError;

#[derive(Parser)]
#[command(name = "bundlesync")]
#[command(about = "Incremental asset bundle updates", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a configuration file with default settings
    Init {
        /// Candidate base URL (repeatable)
        #[arg(long = "url")]
        urls: Vec<String>,

        /// Persistent bundle root
        #[arg(long)]
        root: Option<PathBuf>,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Download and install the latest bundle set
    Update {
        /// Candidate base URL, probed in order (repeatable, overrides config)
        #[arg(long = "url")]
        urls: Vec<String>,

        /// Persistent bundle root (overrides config)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Number of concurrent bundle transfers
        #[arg(long)]
        concurrency: Option<usize>,

        /// Accept a remote version older than the installed one
        #[arg(long)]
        allow_downgrade: bool,
    },

    /// Compare two manifest directories
    Diff {
        /// Directory holding the installed manifests
        #[arg(long)]
        old: PathBuf,

        /// Directory holding the new manifests
        #[arg(long)]
        new: PathBuf,

        /// Directory holding the bundle files (defaults to --old)
        #[arg(long)]
        bundles: Option<PathBuf>,

        /// Only compare bundles that are native in the new manifest
        #[arg(long)]
        initial_only: bool,
    },

    /// Show the installed version, pending resume entries and missing bundles
    Status {
        /// Persistent bundle root (overrides config)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Verify checksums of installed bundles
        #[arg(long)]
        verify: bool,
    },

    /// View and modify configuration settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli
        .config
        .unwrap_or_else(bundlesync::config::config_file_path);

    // Config edits must work even when the file is broken, so these two
    // commands run before the file is parsed.
    match cli.command {
        Commands::Config { command } => commands::config::run(command, &config_path),
        Commands::Init { urls, root, force } => commands::init::run(&config_path, urls, root, force),
        command => run_loaded(command, &config_path, cli.verbose),
    }
}

fn run_loaded(command: Commands, config_path: &Path, verbose: bool) -> Result<(), CliError> {
    let config = commands::common::load_config(config_path)?;
    let mut log_config = config.logging.clone();
    if verbose {
        log_config.level = "debug".to_string();
    }
    let _guard = init_logging(&log_config)?;
    tracing::debug!(config = %config_path.display(), "Loaded configuration");

    match command {
        Commands::Update {
            urls,
            root,
            concurrency,
            allow_downgrade,
        } => commands::update::run(
            &config,
            UpdateArgs {
                urls,
                root,
                concurrency,
                allow_downgrade,
            },
        ),
        Commands::Diff {
            old,
            new,
            bundles,
            initial_only,
        } => commands::diff::run(&config, &old, &new, bundles, initial_only),
        Commands::Status { root, verify } => commands::status::run(&config, root, verify),
        Commands::Config { .. } | Commands::Init { .. } => Ok(()),
    }
}
