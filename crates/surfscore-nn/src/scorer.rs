use crate::config::ModelConfig;
use crate::model::ScoreNet;
use crate::trainer::{features_tensor, BestCheckpoint};
use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use ndarray::{s, Array3};
use std::path::Path;
use surfscore_core::{compute_pair_features, PairRecord, SamplingConfig};
use validator::Validate;

const SCORE_BATCH: usize = 256;

/// A trained network loaded for inference.
pub struct ScoreModel {
    net: ScoreNet,
    config: ModelConfig,
    device: Device,
}

impl ScoreModel {
    pub fn load(weights: &Path, config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        let net = ScoreNet::load(vb, &config)?;
        Ok(Self {
            net,
            config,
            device: device.clone(),
        })
    }

    /// Loads the weights together with the `.json` config saved beside them.
    pub fn load_checkpoint(weights: &Path, device: &Device) -> Result<Self> {
        let config = ModelConfig::load_json(&BestCheckpoint::config_path(weights))?;
        Self::load(weights, config, device)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Probability of the good-alignment class for every row of `(n, max_npoints, channels)`.
    pub fn predict_proba(&self, features: &Array3<f32>) -> Result<Vec<f32>> {
        let n = features.shape()[0];
        let mut scores = Vec::with_capacity(n);
        for start in (0..n).step_by(SCORE_BATCH) {
            let end = (start + SCORE_BATCH).min(n);
            let batch = features.slice(s![start..end, .., ..]).to_owned();
            let xs = features_tensor(&batch, &self.device)?;
            let probs = self.net.predict_proba(&xs)?;
            scores.extend(probs.narrow(1, 1, 1)?.squeeze(1)?.to_vec1::<f32>()?);
        }
        Ok(scores)
    }

    /// Scores every candidate source patch of `pair`, in candidate order.
    pub fn score_pair(&self, pair: &PairRecord, sampling: &SamplingConfig) -> Result<Vec<f32>> {
        let features = compute_pair_features(pair, sampling)?;
        self.predict_proba(&features.features)
    }
}
