//! Pipeline states.

use std::fmt;

/// States of the update pipeline.
///
/// ```text
/// Initialize → VerifyUrl → DownloadMainConfig → UpdateAssetBundle
///            → CopyCacheFile → Dispose → Completed | Failed
///
/// any working state ──cancel()──► (Dispose) → Cancel
/// any working state ──abort()───► (Dispose) → Abort
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    Initialize,
    VerifyUrl,
    DownloadMainConfig,
    UpdateAssetBundle,
    CopyCacheFile,
    Dispose,
    Completed,
    Failed,
    Cancel,
    Abort,
}

impl UpdateState {
    /// Working states in execution order.
    pub const PIPELINE: [UpdateState; 6] = [
        UpdateState::Initialize,
        UpdateState::VerifyUrl,
        UpdateState::DownloadMainConfig,
        UpdateState::UpdateAssetBundle,
        UpdateState::CopyCacheFile,
        UpdateState::Dispose,
    ];

    /// Whether the pipeline has stopped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::Completed | UpdateState::Failed | UpdateState::Cancel | UpdateState::Abort
        )
    }

    /// The working state after this one on the success path.
    pub fn next(self) -> Option<UpdateState> {
        let index = Self::PIPELINE.iter().position(|s| *s == self)?;
        Self::PIPELINE.get(index + 1).copied()
    }

    /// Short name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            UpdateState::Initialize => "initialize",
            UpdateState::VerifyUrl => "verify_url",
            UpdateState::DownloadMainConfig => "download_main_config",
            UpdateState::UpdateAssetBundle => "update_asset_bundle",
            UpdateState::CopyCacheFile => "copy_cache_file",
            UpdateState::Dispose => "dispose",
            UpdateState::Completed => "completed",
            UpdateState::Failed => "failed",
            UpdateState::Cancel => "cancel",
            UpdateState::Abort => "abort",
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_follows_pipeline() {
        assert_eq!(UpdateState::Initialize.next(), Some(UpdateState::VerifyUrl));
        assert_eq!(UpdateState::CopyCacheFile.next(), Some(UpdateState::Dispose));
        assert_eq!(UpdateState::Dispose.next(), None);
        assert_eq!(UpdateState::Failed.next(), None);
    }

    #[test]
    fn test_terminal_states() {
        for state in UpdateState::PIPELINE {
            assert!(!state.is_terminal());
        }
        assert!(UpdateState::Completed.is_terminal());
        assert!(UpdateState::Abort.is_terminal());
    }
}
