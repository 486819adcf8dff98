use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Per-point feature channels: spatial distance and descriptor distance.
pub const N_FEATURES: usize = 2;

/// What to do with a pair whose negative pool cannot fill the random-negative quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NegativeShortfall {
    /// Abort the whole assembly.
    #[default]
    #[value(name = "error")]
    Error,
    /// Drop the pair and keep going.
    #[value(name = "skip")]
    Skip,
}

/// Thresholds and quotas for the correspondence and sampling engine.
///
/// Defaults are the values the published scoring network was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SamplingConfig {
    /// Positive rows emitted per pair (subsampled or tiled).
    #[validate(range(min = 1))]
    pub n_positives: usize,
    /// Negative rows requested per pair; half of them are hard negatives.
    pub n_negatives: usize,
    /// Candidates with an RMSD strictly below this are positives.
    #[validate(range(exclusive_min = 0.0))]
    pub max_rmsd: f32,
    /// Point slots per candidate feature tensor.
    #[validate(range(min = 1))]
    pub max_npoints: usize,
    /// Spatial distance under which a matched point counts as an inlier.
    #[validate(range(exclusive_min = 0.0))]
    pub inlier_distance: f32,
    pub seed: u64,
    pub negative_shortfall: NegativeShortfall,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n_positives: 100,
            n_negatives: 100,
            max_rmsd: 5.0,
            max_npoints: 200,
            inlier_distance: 1.5,
            seed: 42,
            negative_shortfall: NegativeShortfall::Error,
        }
    }
}

impl SamplingConfig {
    /// Upper bound on the number of rows a single pair can contribute.
    pub fn samples_per_pair(&self) -> usize {
        self.n_positives + self.n_negatives
    }

    pub fn n_hard_negatives(&self) -> usize {
        self.n_negatives / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SamplingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.samples_per_pair(), 200);
        assert_eq!(config.n_hard_negatives(), 50);
    }

    #[test]
    fn test_rejects_zero_quota() {
        let config = SamplingConfig {
            n_positives: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SamplingConfig =
            serde_json::from_str(r#"{"max_rmsd": 3.0, "negative_shortfall": "skip"}"#).unwrap();
        assert_eq!(config.max_rmsd, 3.0);
        assert_eq!(config.negative_shortfall, NegativeShortfall::Skip);
        assert_eq!(config.n_positives, 100);
    }
}
