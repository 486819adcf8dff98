use super::assemble::assemble_from_source;
use crate::cli::PairSource;
use anyhow::Result;
use std::path::PathBuf;
use surfscore_core::{SamplingConfig, TrainingSet};
use surfscore_nn::{device, ModelConfig, TrainConfig, Trainer};

pub struct TrainJob {
    pub source: PairSource,
    pub dataset: Option<PathBuf>,
    pub save_dataset: Option<PathBuf>,
    pub sampling: SamplingConfig,
    pub model_config: ModelConfig,
    pub train_config: TrainConfig,
    pub cpu: bool,
}

pub fn execute(job: TrainJob) -> Result<()> {
    let set = match &job.dataset {
        Some(path) => {
            log::info!("loading training set {}", path.display());
            TrainingSet::load(path)?
        }
        None => assemble_from_source(&job.source, &job.sampling)?,
    };
    if let Some(path) = &job.save_dataset {
        set.save(path)?;
        log::info!("wrote {}", path.display());
    }

    let device = device(job.cpu)?;
    let checkpoint = job.train_config.checkpoint_path.clone();
    let mut trainer = Trainer::new(job.model_config, job.train_config, device)?
        .with_default_callbacks()?;
    let history = trainer.fit(&set)?;

    if let Some(best) = history.best() {
        log::info!(
            "best epoch {} with loss {:.4}, weights at {}",
            best.epoch,
            best.monitored(),
            checkpoint.display()
        );
    }
    Ok(())
}
