//! CLI error type and exit codes.

use thiserror::Error;

use bundlesync::config::ConfigError;
use bundlesync::{ErrorCode, SyncError, UpdateState};

/// Errors surfaced by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A library call failed outside the update pipeline.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The update pipeline finished in `Failed`.
    #[error("Update failed ({code}): {message}")]
    Update { code: ErrorCode, message: String },

    /// The update was stopped by the user.
    #[error("Update stopped: {0}")]
    Interrupted(UpdateState),

    /// Local files are missing or corrupt.
    #[error("{0} problem(s) found")]
    Verify(usize),
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Sync(_) => 1,
            CliError::Update { code, .. } => match code {
                ErrorCode::ParameterError => 2,
                ErrorCode::DiskFull => 4,
                _ => 3,
            },
            CliError::Interrupted(_) => 130,
            CliError::Verify(_) => 5,
        }
    }
}
