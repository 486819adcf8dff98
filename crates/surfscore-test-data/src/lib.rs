//! surfscore-test-data
//!
//! Synthetic protein pairs for tests.
//!
//! Pairs are generated from a seed, so the same `SyntheticPair` always yields the same record.
//! `TestDataset` writes a set of pairs plus a training list into a temporary directory laid out the
//! way the assembly loop expects.
//!
//! ```ignore
//! use surfscore_test_data::{SyntheticPair, TestDataset};
//! // _dataset keeps the temporary directory alive
//! let dataset = TestDataset::create(&[SyntheticPair::new("1ABC_A_B", 120, 300)])?;
//! let pairs = discover_pairs(&dataset.data_dir, &read_training_list(&dataset.training_list)?)?;
//! ```
use anyhow::Result;
use ndarray::{stack, Array1, Array2, Axis};
use ndarray_npy::write_npy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::{Path, PathBuf};
use surfscore_core::pair::legacy;
use surfscore_core::ragged;
use surfscore_core::PairRecord;
use tempfile::TempDir;

/// Generator for one protein pair.
///
/// Positive candidates are loosely jittered copies of target points with near-matching descriptors
/// and an RMSD below 5. Negatives are displaced and carry unrelated descriptors, except every fourth
/// one, which sits tightly on the target surface and so outranks the positives on inlier rate.
#[derive(Debug, Clone)]
pub struct SyntheticPair {
    pub pair_id: String,
    pub n_positive: usize,
    pub n_negative: usize,
    pub points_per_patch: usize,
    pub descriptor_dim: usize,
    pub seed: u64,
    /// Vary the point count per candidate instead of using `points_per_patch` for all of them.
    pub ragged: bool,
}

impl SyntheticPair {
    pub fn new(pair_id: &str, n_positive: usize, n_negative: usize) -> Self {
        Self {
            pair_id: pair_id.to_string(),
            n_positive,
            n_negative,
            points_per_patch: 40,
            descriptor_dim: 8,
            seed: 0,
            ragged: false,
        }
    }

    pub fn points_per_patch(mut self, n: usize) -> Self {
        self.points_per_patch = n;
        self
    }

    pub fn descriptor_dim(mut self, dim: usize) -> Self {
        self.descriptor_dim = dim;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Candidate `c` gets `points_per_patch - c % 5` points.
    pub fn ragged(mut self) -> Self {
        self.ragged = true;
        self
    }

    pub fn build(&self) -> PairRecord {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let n_target = self.points_per_patch * 2;
        let dim = self.descriptor_dim;

        let target_patch = Array2::from_shape_fn((n_target, 3), |_| rng.gen_range(0.0f32..12.0));
        let target_descs = Array2::from_shape_fn((n_target, dim), |_| rng.gen_range(-1.0f32..1.0));

        let n_candidates = self.n_positive + self.n_negative;
        let mut source_patches = Vec::with_capacity(n_candidates);
        let mut source_descs = Vec::with_capacity(n_candidates);
        let mut rmsds = Vec::with_capacity(n_candidates);

        for c in 0..n_candidates {
            let positive = c < self.n_positive;
            let on_surface = positive || (c - self.n_positive) % 4 == 0;
            let n_points = if self.ragged {
                self.points_per_patch.saturating_sub(c % 5)
            } else {
                self.points_per_patch
            };
            let picks: Vec<usize> = (0..n_points)
                .map(|_| rng.gen_range(0..n_target))
                .collect();

            let offset = if on_surface {
                [0.0; 3]
            } else {
                [rng.gen_range(4.0f32..8.0), rng.gen_range(4.0f32..8.0), 0.0]
            };
            let jitter = if positive { 1.5f32 } else { 0.1 };
            let patch = Array2::from_shape_fn((picks.len(), 3), |(i, k)| {
                target_patch[[picks[i], k]] + offset[k] + rng.gen_range(-jitter..jitter)
            });
            let descs = Array2::from_shape_fn((picks.len(), dim), |(i, k)| {
                if positive {
                    target_descs[[picks[i], k]] + rng.gen_range(-0.05f32..0.05)
                } else {
                    rng.gen_range(-1.0f32..1.0)
                }
            });
            source_patches.push(patch);
            source_descs.push(descs);
            rmsds.push(if positive {
                rng.gen_range(0.5f32..4.5)
            } else {
                rng.gen_range(6.0f32..20.0)
            });
        }

        PairRecord::new(
            self.pair_id.clone(),
            source_patches,
            source_descs,
            target_patch,
            target_descs,
            Array1::from(rmsds),
        )
        .expect("synthetic pairs are well formed")
    }

    /// Writes the pair as the five `.npy` files of the legacy layout. Source arrays are ragged
    /// object arrays for a ragged pair and dense three-dimensional arrays otherwise.
    pub fn write_legacy(&self, dir: &Path) -> Result<PairRecord> {
        let pair = self.build();
        fs::create_dir_all(dir)?;
        let write_blocks = |name: &str, blocks: &[Array2<f32>]| -> Result<()> {
            let path = dir.join(name);
            if self.ragged {
                ragged::write_ragged(&path, blocks)?;
            } else {
                let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
                write_npy(&path, &stack(Axis(0), &views)?)?;
            }
            Ok(())
        };
        write_blocks(legacy::SOURCE_PATCHES, &pair.source_patches)?;
        write_blocks(legacy::SOURCE_DESCS, &pair.source_descs)?;
        write_npy(dir.join(legacy::TARGET_PATCH), &pair.target_patch)?;
        write_npy(dir.join(legacy::TARGET_DESCS), &pair.target_descs)?;
        write_npy(dir.join(legacy::SOURCE_RMSDS), &pair.source_patch_rmsds)?;
        Ok(pair)
    }
}

/// A temporary `transformation_data/` tree plus a training list.
pub struct TestDataset {
    pub root: TempDir,
    pub data_dir: PathBuf,
    pub training_list: PathBuf,
}

impl TestDataset {
    /// Writes every pair and lists all of them for training.
    pub fn create(pairs: &[SyntheticPair]) -> Result<Self> {
        let root = tempfile::Builder::new().prefix("surfscore").tempdir()?;
        let data_dir = root.path().join("transformation_data");
        let lists = root.path().join("lists");
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&lists)?;

        for pair in pairs {
            pair.build().save(&data_dir.join(&pair.pair_id))?;
        }
        let training_list = lists.join("training.txt");
        let names: Vec<&str> = pairs.iter().map(|p| p.pair_id.as_str()).collect();
        fs::write(&training_list, names.join("\n") + "\n")?;

        Ok(Self {
            root,
            data_dir,
            training_list,
        })
    }

    /// Writes a pair that is present on disk but missing from the training list.
    pub fn add_unlisted(&self, pair: &SyntheticPair) -> Result<PathBuf> {
        Ok(pair.build().save(&self.data_dir.join(&pair.pair_id))?)
    }

    pub fn pair_dir(&self, pair_id: &str) -> PathBuf {
        self.data_dir.join(pair_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_pair() {
        let a = SyntheticPair::new("p", 5, 7).seed(3).build();
        let b = SyntheticPair::new("p", 5, 7).seed(3).build();
        assert_eq!(a, b);
        assert_eq!(a.n_candidates(), 12);
        assert_eq!(a.descriptor_dim(), 8);
        assert_eq!(a.source_patch_rmsds.iter().filter(|&&r| r < 5.0).count(), 5);
    }

    #[test]
    fn test_ragged_point_counts() {
        let pair = SyntheticPair::new("p", 3, 4).points_per_patch(10).ragged().build();
        let npoints: Vec<_> = pair.source_patches.iter().map(|p| p.nrows()).collect();
        assert_eq!(npoints, vec![10, 9, 8, 7, 6, 10, 9]);
    }

    #[test]
    fn test_dataset_layout() {
        let dataset = TestDataset::create(&[
            SyntheticPair::new("1ABC_A_B", 3, 4),
            SyntheticPair::new("2XYZ_C_D", 3, 4),
        ])
        .unwrap();
        assert!(dataset.pair_dir("1ABC_A_B").join("pair.safetensors").is_file());
        let list = fs::read_to_string(&dataset.training_list).unwrap();
        assert_eq!(list.lines().count(), 2);
    }
}
