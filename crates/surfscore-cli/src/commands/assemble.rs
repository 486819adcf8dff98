use crate::cli::PairSource;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use surfscore_core::{
    assemble_dataset, discover_pairs, read_training_list, PairOutcome, SamplingConfig, TrainingSet,
};

/// Loads the training list, finds the listed pairs and assembles them.
pub fn assemble_from_source(source: &PairSource, sampling: &SamplingConfig) -> Result<TrainingSet> {
    let training = read_training_list(&source.training_list)
        .with_context(|| format!("reading training list {}", source.training_list.display()))?;
    let pairs: Vec<PathBuf> = discover_pairs(&source.data_dir, &training)?;
    log::info!(
        "{} of {} listed pairs found under {}",
        pairs.len(),
        training.len(),
        source.data_dir.display()
    );

    let (set, report) = assemble_dataset(&pairs, sampling)?;
    for (pair_id, outcome) in &report.pairs {
        if let PairOutcome::Included { samples } = outcome {
            log::debug!("{pair_id}: {samples} samples");
        }
    }
    log::info!(
        "{} pairs included, {} skipped, {} samples ({} positive)",
        report.n_included(),
        report.n_skipped(),
        set.n_samples(),
        set.n_positive()
    );
    Ok(set)
}

pub fn execute(source: &PairSource, sampling: &SamplingConfig, output: &Path) -> Result<()> {
    let set = assemble_from_source(source, sampling)?;
    set.save(output)?;
    log::info!("wrote {}", output.display());
    Ok(())
}
