use anyhow::Result;
use std::io::{self, Write};
use std::path::Path;
use surfscore_core::{PairRecord, SamplingConfig};
use surfscore_nn::{device, ModelConfig, ScoreModel};

/// Prints `candidate<TAB>rmsd<TAB>score` for every candidate of the pair.
pub fn execute(
    pair_dir: &Path,
    weights: &Path,
    config: Option<&Path>,
    sampling: &SamplingConfig,
    cpu: bool,
) -> Result<()> {
    let device = device(cpu)?;
    let model = match config {
        Some(path) => ScoreModel::load(weights, ModelConfig::load_json(path)?, &device)?,
        None => ScoreModel::load_checkpoint(weights, &device)?,
    };
    let pair = PairRecord::load(pair_dir)?;
    let scores = model.score_pair(&pair, sampling)?;

    let mut out = io::stdout().lock();
    writeln!(out, "candidate\trmsd\tscore")?;
    for (i, (score, rmsd)) in scores.iter().zip(pair.source_patch_rmsds.iter()).enumerate() {
        writeln!(out, "{i}\t{rmsd:.3}\t{score:.6}")?;
    }
    Ok(())
}
