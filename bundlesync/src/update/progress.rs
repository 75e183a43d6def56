//! Weighted progress across pipeline stages.

use super::state::UpdateState;

/// Share of overall progress owned by each working state.
///
/// Overall progress is `start(state) + local × weight(state)`, normalized by
/// the sum of all weights so it always lands in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageWeights {
    pub initialize: f64,
    pub verify_url: f64,
    pub download_main_config: f64,
    pub update_asset_bundle: f64,
    pub copy_cache_file: f64,
    pub dispose: f64,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            initialize: 0.01,
            verify_url: 0.02,
            download_main_config: 0.05,
            update_asset_bundle: 0.85,
            copy_cache_file: 0.05,
            dispose: 0.02,
        }
    }
}

impl StageWeights {
    fn ordered(&self) -> [(UpdateState, f64); 6] {
        [
            (UpdateState::Initialize, self.initialize),
            (UpdateState::VerifyUrl, self.verify_url),
            (UpdateState::DownloadMainConfig, self.download_main_config),
            (UpdateState::UpdateAssetBundle, self.update_asset_bundle),
            (UpdateState::CopyCacheFile, self.copy_cache_file),
            (UpdateState::Dispose, self.dispose),
        ]
    }

    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.ordered().iter().map(|(_, w)| w).sum()
    }

    /// Whether every weight is non-negative and at least one is positive.
    pub fn is_valid(&self) -> bool {
        let ordered = self.ordered();
        ordered.iter().all(|(_, w)| w.is_finite() && *w >= 0.0) && self.total() > 0.0
    }

    /// Weight of a working state; zero for terminal states.
    pub fn weight(&self, state: UpdateState) -> f64 {
        self.ordered()
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, w)| *w)
            .unwrap_or(0.0)
    }

    /// Sum of the weights of the states before `state`.
    pub fn start(&self, state: UpdateState) -> f64 {
        self.ordered()
            .iter()
            .take_while(|(s, _)| *s != state)
            .map(|(_, w)| w)
            .sum()
    }

    /// Overall progress in `[0, 1]` for `state` at `local` completion.
    pub fn overall(&self, state: UpdateState, local: f64) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }
        let raw = match state {
            UpdateState::Completed => total,
            _ if state.is_terminal() => return 0.0,
            _ => self.start(state) + local.clamp(0.0, 1.0) * self.weight(state),
        };
        (raw / total).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        let weights = StageWeights::default();
        assert!((weights.total() - 1.0).abs() < 1e-9);
        assert!(weights.is_valid());
    }

    #[test]
    fn test_overall_progress() {
        let weights = StageWeights::default();

        assert_eq!(weights.overall(UpdateState::Initialize, 0.0), 0.0);
        let halfway = weights.overall(UpdateState::UpdateAssetBundle, 0.5);
        assert!((halfway - (0.08 + 0.425)).abs() < 1e-9);
        assert_eq!(weights.overall(UpdateState::Completed, 0.0), 1.0);
    }

    #[test]
    fn test_overall_is_monotonic_across_states() {
        let weights = StageWeights::default();
        let mut last = 0.0;
        for state in UpdateState::PIPELINE {
            let begin = weights.overall(state, 0.0);
            let end = weights.overall(state, 1.0);
            assert!(begin >= last);
            assert!(end >= begin);
            last = end;
        }
    }

    #[test]
    fn test_invalid_weights() {
        let weights = StageWeights {
            update_asset_bundle: -1.0,
            ..StageWeights::default()
        };
        assert!(!weights.is_valid());
    }
}
