//! Mini-batch training loop for [`ScoreNet`](crate::model::ScoreNet).
//!
//! Rows keep their assembly order, so the validation rows are the tail of the training set. The
//! training rows are reshuffled every epoch from a seeded `ChaCha8Rng`.
use crate::config::{ModelConfig, TrainConfig};
use crate::metrics::{accuracy, roc_auc};
use crate::model::ScoreNet;
use anyhow::Result;
use candle_core::{DType, Device, ModuleT, Tensor, D};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use ndarray::Array3;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use surfscore_core::{SurfScoreError, TrainingSet};
use validator::Validate;

pub const METRICS_FILE: &str = "metrics.jsonl";

/// Row-major copy of a host feature array onto `device`.
pub fn features_tensor(features: &Array3<f32>, device: &Device) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = features.iter().copied().collect();
    Tensor::from_vec(data, features.dim(), device)
}

/// Number of leading rows used for training; the rest is validation.
///
/// Rows are held out in assembly order, before any shuffling. Each pair contributes its positives
/// first and its negatives last, so on a multi-pair set the trailing split usually holds only the
/// last pair's negatives. With a single class in the validation rows `val_auroc` is `None`.
pub fn split_point(n_samples: usize, validation_split: f64) -> usize {
    (n_samples as f64 * (1.0 - validation_split)) as usize
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
    pub val_auroc: Option<f64>,
}

impl EpochMetrics {
    /// Validation loss when there is a validation split, training loss otherwise.
    pub fn monitored(&self) -> f64 {
        self.val_loss.unwrap_or(self.loss)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub epochs: Vec<EpochMetrics>,
}

impl History {
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Epoch with the lowest monitored loss. NaN losses never win.
    pub fn best(&self) -> Option<&EpochMetrics> {
        self.epochs
            .iter()
            .filter(|m| !m.monitored().is_nan())
            .min_by(|a, b| a.monitored().total_cmp(&b.monitored()))
    }
}

/// Loss, accuracy and ROC AUC over a set of rows in inference mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub auroc: Option<f64>,
}

/// Hook run at the end of every epoch.
pub trait TrainingCallback {
    fn on_epoch_end(
        &mut self,
        metrics: &EpochMetrics,
        varmap: &VarMap,
        model_config: &ModelConfig,
    ) -> Result<()>;
}

/// Saves the weights and their `ModelConfig` whenever the monitored loss improves.
pub struct BestCheckpoint {
    path: PathBuf,
    best: f64,
}

impl BestCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            best: f64::INFINITY,
        }
    }

    /// Model config written next to the weights file.
    pub fn config_path(weights: &Path) -> PathBuf {
        weights.with_extension("json")
    }
}

impl TrainingCallback for BestCheckpoint {
    fn on_epoch_end(
        &mut self,
        metrics: &EpochMetrics,
        varmap: &VarMap,
        model_config: &ModelConfig,
    ) -> Result<()> {
        let monitored = metrics.monitored();
        if monitored.is_nan() || monitored >= self.best {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        varmap.save(&self.path)?;
        model_config.save_json(&Self::config_path(&self.path))?;
        log::info!(
            "epoch {}: loss improved from {:.5} to {:.5}, saved {}",
            metrics.epoch,
            self.best,
            monitored,
            self.path.display()
        );
        self.best = monitored;
        Ok(())
    }
}

#[derive(Serialize)]
struct MetricsRecord<'a> {
    #[serde(flatten)]
    metrics: &'a EpochMetrics,
    timestamp: String,
}

/// One JSON line per epoch in `<log_dir>/metrics.jsonl`.
pub struct MetricsLog {
    path: PathBuf,
    file: File,
}

impl MetricsLog {
    /// Creates the log directory and starts a fresh log file.
    pub fn create(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(METRICS_FILE);
        let file = File::create(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrainingCallback for MetricsLog {
    fn on_epoch_end(&mut self, metrics: &EpochMetrics, _: &VarMap, _: &ModelConfig) -> Result<()> {
        let record = MetricsRecord {
            metrics,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        writeln!(self.file, "{}", serde_json::to_string(&record)?)?;
        self.file.flush()?;
        Ok(())
    }
}

pub struct Trainer {
    model: ScoreNet,
    varmap: VarMap,
    model_config: ModelConfig,
    train_config: TrainConfig,
    device: Device,
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl Trainer {
    /// Builds a freshly initialised network on `device`.
    pub fn new(model_config: ModelConfig, train_config: TrainConfig, device: Device) -> Result<Self> {
        model_config.validate()?;
        train_config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ScoreNet::load(vb, &model_config)?;
        Ok(Self {
            model,
            varmap,
            model_config,
            train_config,
            device,
            callbacks: Vec::new(),
        })
    }

    pub fn with_callback(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Adds [`BestCheckpoint`] and [`MetricsLog`] at the configured paths.
    pub fn with_default_callbacks(self) -> Result<Self> {
        let checkpoint = BestCheckpoint::new(&self.train_config.checkpoint_path);
        let metrics = MetricsLog::create(&self.train_config.log_dir)?;
        Ok(self.with_callback(checkpoint).with_callback(metrics))
    }

    pub fn model(&self) -> &ScoreNet {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn fit(&mut self, data: &TrainingSet) -> Result<History> {
        let n = data.n_samples();
        let n_train = split_point(n, self.train_config.validation_split);
        if n_train == 0 {
            return Err(SurfScoreError::EmptyDataset.into());
        }
        let labels: Vec<u32> = data.labels.iter().copied().collect();
        let xs = features_tensor(&data.features, &self.device)?;
        let ys = Tensor::from_slice(&labels, n, &self.device)?;
        let train_xs = xs.narrow(0, 0, n_train)?;
        let train_ys = ys.narrow(0, 0, n_train)?;
        let val_xs = if n_train < n {
            Some(xs.narrow(0, n_train, n - n_train)?)
        } else {
            None
        };
        let val_labels = &labels[n_train..];
        log::info!(
            "training on {n_train} samples, validating on {} samples",
            n - n_train
        );

        let TrainConfig {
            learning_rate,
            batch_size,
            epochs,
            shuffle,
            seed,
            ..
        } = self.train_config;
        let params = ParamsAdamW {
            lr: learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.0,
        };
        let mut optimizer = AdamW::new(self.varmap.all_vars(), params)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<u32> = (0..n_train as u32).collect();
        let mut history = History::default();

        for epoch in 1..=epochs {
            if shuffle {
                order.shuffle(&mut rng);
            }
            let mut loss_sum = 0.0;
            let mut correct = 0.0;
            for batch in order.chunks(batch_size) {
                let index = Tensor::from_slice(batch, batch.len(), &self.device)?;
                let batch_xs = train_xs.index_select(&index, 0)?;
                let batch_ys = train_ys.index_select(&index, 0)?;

                let logits = self.model.forward_t(&batch_xs, true)?;
                let mut batch_loss = loss::cross_entropy(&logits, &batch_ys)?;
                if let Some(penalty) = self.model.l2_penalty()? {
                    batch_loss = (batch_loss + penalty)?;
                }
                optimizer.backward_step(&batch_loss)?;

                loss_sum += batch_loss.to_scalar::<f32>()? as f64 * batch.len() as f64;
                correct += logits
                    .argmax(D::Minus1)?
                    .eq(&batch_ys)?
                    .to_dtype(DType::F32)?
                    .sum_all()?
                    .to_scalar::<f32>()? as f64;
            }

            let validation = match &val_xs {
                Some(val_xs) => Some(self.evaluate(val_xs, val_labels)?),
                None => None,
            };
            let metrics = EpochMetrics {
                epoch,
                loss: loss_sum / n_train as f64,
                accuracy: correct / n_train as f64,
                val_loss: validation.as_ref().map(|v| v.loss),
                val_accuracy: validation.as_ref().map(|v| v.accuracy),
                val_auroc: validation.as_ref().and_then(|v| v.auroc),
            };
            if metrics.loss.is_nan() {
                log::warn!("epoch {epoch}: training loss is NaN");
            }
            log::info!(
                "epoch {epoch}/{epochs} loss {:.4} acc {:.4} val_loss {} val_acc {} val_auroc {}",
                metrics.loss,
                metrics.accuracy,
                fmt_metric(metrics.val_loss),
                fmt_metric(metrics.val_accuracy),
                fmt_metric(metrics.val_auroc),
            );

            for callback in self.callbacks.iter_mut() {
                callback.on_epoch_end(&metrics, &self.varmap, &self.model_config)?;
            }
            history.epochs.push(metrics);
        }
        Ok(history)
    }

    /// Scores `features` in inference mode against `labels`.
    pub fn evaluate(&self, features: &Tensor, labels: &[u32]) -> Result<Evaluation> {
        let n = labels.len();
        let batch_size = self.train_config.batch_size;
        let mut loss_sum = 0.0;
        let mut scores = Vec::with_capacity(n);
        let mut predictions = Vec::with_capacity(n);

        let mut start = 0;
        while start < n {
            let len = batch_size.min(n - start);
            let xs = features.narrow(0, start, len)?;
            let ys = Tensor::from_slice(&labels[start..start + len], len, &self.device)?;
            let logits = self.model.forward_t(&xs, false)?;
            loss_sum += loss::cross_entropy(&logits, &ys)?.to_scalar::<f32>()? as f64 * len as f64;
            predictions.extend(logits.argmax(D::Minus1)?.to_vec1::<u32>()?);
            let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
            scores.extend(probs.narrow(1, 1, 1)?.squeeze(1)?.to_vec1::<f32>()?);
            start += len;
        }

        Ok(Evaluation {
            loss: if n == 0 { 0.0 } else { loss_sum / n as f64 },
            accuracy: accuracy(&predictions, labels),
            auroc: roc_auc(&scores, labels),
        })
    }
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_point() {
        assert_eq!(split_point(600, 0.1), 540);
        assert_eq!(split_point(10, 0.0), 10);
        assert_eq!(split_point(3, 0.5), 1);
    }

    fn metrics(epoch: usize, loss: f64, val_loss: Option<f64>) -> EpochMetrics {
        EpochMetrics {
            epoch,
            loss,
            accuracy: 0.5,
            val_loss,
            val_accuracy: None,
            val_auroc: None,
        }
    }

    #[test]
    fn test_history_best_uses_validation_loss() {
        let history = History {
            epochs: vec![
                metrics(1, 0.2, Some(0.9)),
                metrics(2, 0.5, Some(0.4)),
                metrics(3, 0.1, Some(f64::NAN)),
            ],
        };
        assert_eq!(history.best().unwrap().epoch, 2);
        assert_eq!(history.last().unwrap().epoch, 3);
    }

    #[test]
    fn test_checkpoint_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt").join("model.safetensors");
        let varmap = VarMap::new();
        varmap
            .get((2, 2), "w", candle_nn::Init::Const(1.0), DType::F32, &Device::Cpu)
            .unwrap();
        let config = ModelConfig::default();
        let mut checkpoint = BestCheckpoint::new(&path);

        checkpoint
            .on_epoch_end(&metrics(1, 0.7, None), &varmap, &config)
            .unwrap();
        assert!(path.is_file());
        assert!(BestCheckpoint::config_path(&path).is_file());

        fs::remove_file(&path).unwrap();
        checkpoint
            .on_epoch_end(&metrics(2, 0.8, None), &varmap, &config)
            .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_metrics_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MetricsLog::create(&dir.path().join("logs")).unwrap();
        let varmap = VarMap::new();
        let config = ModelConfig::default();
        for epoch in 1..=3 {
            log.on_epoch_end(&metrics(epoch, 0.5, Some(0.6)), &varmap, &config)
                .unwrap();
        }
        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["epoch"], 3);
        assert_eq!(lines[0]["val_loss"], 0.6);
        assert!(lines[0]["timestamp"].is_string());
        assert!(lines[0]["val_auroc"].is_null());
    }
}
