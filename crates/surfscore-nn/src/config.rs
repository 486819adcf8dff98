use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use surfscore_core::N_FEATURES;
use validator::Validate;

/// Topology of the scoring network.
///
/// Per-point 1x1 convolution blocks widen the input channels, average pooling collapses the point
/// dimension, and a tapering dense stack ends in `n_classes` logits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ModelConfig {
    #[validate(range(min = 1))]
    pub in_channels: usize,
    #[validate(length(min = 1))]
    pub conv_channels: Vec<usize>,
    pub dense_units: Vec<usize>,
    #[validate(range(min = 2))]
    pub n_classes: usize,
    /// L2 penalty on the hidden dense kernels; zero turns it off.
    #[validate(range(min = 0.0))]
    pub l2_regularization: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub batch_norm_eps: f64,
    /// Weight of the current batch in the running statistics.
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub batch_norm_momentum: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: N_FEATURES,
            conv_channels: vec![16, 32, 64, 128, 256],
            dense_units: vec![128, 64, 32, 16, 8, 4],
            n_classes: 2,
            l2_regularization: 0.0,
            batch_norm_eps: 1e-3,
            batch_norm_momentum: 0.01,
        }
    }
}

impl ModelConfig {
    pub fn load_json(path: &Path) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Width of the pooled embedding fed to the dense stack.
    pub fn embedding_dim(&self) -> usize {
        self.conv_channels.last().copied().unwrap_or(self.in_channels)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TrainConfig {
    #[validate(range(exclusive_min = 0.0))]
    pub learning_rate: f64,
    #[validate(range(min = 1))]
    pub batch_size: usize,
    #[validate(range(min = 1))]
    pub epochs: usize,
    /// Fraction of rows, taken from the end, held out for validation.
    #[validate(range(min = 0.0, exclusive_max = 1.0))]
    pub validation_split: f64,
    pub shuffle: bool,
    pub seed: u64,
    pub checkpoint_path: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            batch_size: 32,
            epochs: 50,
            validation_split: 0.1,
            shuffle: true,
            seed: 42,
            checkpoint_path: PathBuf::from("models/nn_score/trained_model.safetensors"),
            log_dir: PathBuf::from("logs/nn_score"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topology() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.in_channels, 2);
        assert_eq!(config.embedding_dim(), 256);
        assert_eq!(config.dense_units, vec![128, 64, 32, 16, 8, 4]);
    }

    #[test]
    fn test_model_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let config = ModelConfig {
            dense_units: vec![8],
            l2_regularization: 1e-4,
            ..Default::default()
        };
        config.save_json(&path).unwrap();
        assert_eq!(ModelConfig::load_json(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_split_rejected() {
        let config = TrainConfig {
            validation_split: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(TrainConfig::default().validate().is_ok());
    }
}
