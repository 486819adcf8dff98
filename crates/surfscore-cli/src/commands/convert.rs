use anyhow::Result;
use std::path::Path;
use surfscore_core::PairRecord;

pub fn execute(pair_dir: &Path, pair_id: Option<String>, output_dir: Option<&Path>) -> Result<()> {
    let mut pair = PairRecord::load_legacy(pair_dir)?;
    if let Some(pair_id) = pair_id {
        pair.pair_id = pair_id;
    }
    let path = pair.save(output_dir.unwrap_or(pair_dir))?;
    log::info!(
        "{}: {} candidates written to {}",
        pair.pair_id,
        pair.n_candidates(),
        path.display()
    );
    Ok(())
}
