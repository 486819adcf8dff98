//! Protein pair records.
//!
//! A pair directory holds every candidate alignment of one source protein onto one target patch.
//! The native on-disk form is a single `pair.safetensors` file with named tensors and a schema
//! version in its header. Directories written by the older pipeline (five `.npy` files) can still be
//! read; their per-candidate arrays may be ragged `dtype=object` arrays or dense numeric ones.
use crate::error::{Result, SurfScoreError};
use crate::ragged;
use crate::tensors::{write_file, RawTensor, TensorFile};
use ndarray::{s, Array, Array1, Array2, Array3, ArrayView2, Axis, Dimension, Ix1, Ix2};
use ndarray_npy::{read_npy, ReadNpyError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const RECORD_FILE: &str = "pair.safetensors";
pub const RECORD_FORMAT: &str = "surfscore-pair";
pub const SCHEMA_VERSION: u32 = 1;

/// File names of the legacy five-array layout.
pub mod legacy {
    pub const SOURCE_PATCHES: &str = "aligned_source_patches.npy";
    pub const TARGET_PATCH: &str = "target_patch.npy";
    pub const SOURCE_DESCS: &str = "aligned_source_patches_descs.npy";
    pub const TARGET_DESCS: &str = "target_patch_descs.npy";
    pub const SOURCE_RMSDS: &str = "source_patch_rmsds.npy";
}

/// All candidate alignments for one protein pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairRecord {
    pub pair_id: String,
    /// One `(n_points, 3)` point cloud per candidate, already aligned onto the target.
    pub source_patches: Vec<Array2<f32>>,
    /// One `(n_points, D)` descriptor block per candidate, row-aligned with `source_patches`.
    pub source_descs: Vec<Array2<f32>>,
    /// `(n_target_points, 3)`
    pub target_patch: Array2<f32>,
    /// `(n_target_points, D)`
    pub target_descs: Array2<f32>,
    /// Ground-truth RMSD of every candidate.
    pub source_patch_rmsds: Array1<f32>,
}

impl PairRecord {
    pub fn new(
        pair_id: impl Into<String>,
        source_patches: Vec<Array2<f32>>,
        source_descs: Vec<Array2<f32>>,
        target_patch: Array2<f32>,
        target_descs: Array2<f32>,
        source_patch_rmsds: Array1<f32>,
    ) -> Result<Self> {
        let record = Self {
            pair_id: pair_id.into(),
            source_patches,
            source_descs,
            target_patch,
            target_descs,
            source_patch_rmsds,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn n_candidates(&self) -> usize {
        self.source_patches.len()
    }

    pub fn descriptor_dim(&self) -> usize {
        self.target_descs.ncols()
    }

    pub fn source_patch(&self, idx: usize) -> ArrayView2<'_, f32> {
        self.source_patches[idx].view()
    }

    /// Checks the index alignment between patches, descriptors and RMSDs, and that every
    /// coordinate and descriptor value is finite.
    pub fn validate(&self) -> Result<()> {
        let id = self.pair_id.as_str();
        let n_patches = self.source_patches.len();
        if self.source_patch_rmsds.len() != n_patches {
            return Err(SurfScoreError::RmsdCountMismatch {
                pair_id: id.to_string(),
                n_rmsds: self.source_patch_rmsds.len(),
                n_patches,
            });
        }
        if self.source_descs.len() != n_patches {
            return Err(SurfScoreError::shape(
                id,
                format!(
                    "{} descriptor blocks for {n_patches} source patches",
                    self.source_descs.len()
                ),
            ));
        }
        if self.target_patch.ncols() != 3 {
            return Err(SurfScoreError::shape(
                id,
                format!("target patch has {} coordinates per point", self.target_patch.ncols()),
            ));
        }
        if self.target_patch.nrows() != self.target_descs.nrows() {
            return Err(SurfScoreError::shape(
                id,
                format!(
                    "target patch has {} points but {} descriptors",
                    self.target_patch.nrows(),
                    self.target_descs.nrows()
                ),
            ));
        }
        let dim = self.descriptor_dim();
        for (i, (patch, descs)) in self.source_patches.iter().zip(&self.source_descs).enumerate() {
            if patch.ncols() != 3 {
                return Err(SurfScoreError::shape(
                    id,
                    format!("source patch {i} has {} coordinates per point", patch.ncols()),
                ));
            }
            if patch.nrows() != descs.nrows() {
                return Err(SurfScoreError::shape(
                    id,
                    format!(
                        "source patch {i} has {} points but {} descriptors",
                        patch.nrows(),
                        descs.nrows()
                    ),
                ));
            }
            if descs.ncols() != dim {
                return Err(SurfScoreError::shape(
                    id,
                    format!(
                        "source patch {i} descriptors have dimension {}, target has {dim}",
                        descs.ncols()
                    ),
                ));
            }
        }

        let non_finite = |arr: &Array2<f32>| arr.iter().any(|v| !v.is_finite());
        if non_finite(&self.target_patch) || non_finite(&self.target_descs) {
            return Err(SurfScoreError::shape(id, "target patch has non-finite values"));
        }
        if let Some(i) = self
            .source_patches
            .iter()
            .zip(&self.source_descs)
            .position(|(patch, descs)| non_finite(patch) || non_finite(descs))
        {
            return Err(SurfScoreError::shape(
                id,
                format!("source patch {i} has non-finite values"),
            ));
        }
        Ok(())
    }

    /// True when `dir` holds a pair in either the native or the legacy layout.
    pub fn is_pair_dir(dir: &Path) -> bool {
        dir.join(RECORD_FILE).is_file() || dir.join(legacy::TARGET_PATCH).is_file()
    }

    /// Loads the pair stored in `dir`, preferring `pair.safetensors` over the legacy files.
    pub fn load(dir: &Path) -> Result<Self> {
        let record = dir.join(RECORD_FILE);
        if record.is_file() {
            Self::load_record(&record)
        } else {
            Self::load_legacy(dir)
        }
    }

    pub fn load_record(path: &Path) -> Result<Self> {
        let buffer = fs::read(path).map_err(SurfScoreError::io(path))?;
        let file = TensorFile::parse(path, &buffer)?;
        file.expect_format(RECORD_FORMAT, SCHEMA_VERSION)?;
        let pair_id = file.meta("pair_id")?.to_string();

        let all_points = into_2d(&file, "source_points", file.f32("source_points")?)?;
        let all_descs = into_2d(&file, "source_descs", file.f32("source_descs")?)?;
        let target_patch = into_2d(&file, "target_points", file.f32("target_points")?)?;
        let target_descs = into_2d(&file, "target_descs", file.f32("target_descs")?)?;
        let rmsds = file
            .f32("rmsds")?
            .into_dimensionality::<Ix1>()
            .map_err(|e| file.schema_error(format!("tensor `rmsds`: {e}")))?;
        let offsets = file
            .i64("source_offsets")?
            .into_dimensionality::<Ix1>()
            .map_err(|e| file.schema_error(format!("tensor `source_offsets`: {e}")))?;

        let total = all_points.nrows();
        if all_descs.nrows() != total {
            return Err(file.schema_error(format!(
                "{} source descriptors for {total} source points",
                all_descs.nrows()
            )));
        }
        let bounds = offsets
            .iter()
            .map(|&o| usize::try_from(o).ok().filter(|&o| o <= total))
            .collect::<Option<Vec<_>>>()
            .filter(|b| b.first() == Some(&0) && b.last() == Some(&total))
            .filter(|b| b.windows(2).all(|w| w[0] <= w[1]))
            .ok_or_else(|| file.schema_error("`source_offsets` must rise from 0 to the point count"))?;

        let (source_patches, source_descs): (Vec<_>, Vec<_>) = bounds
            .windows(2)
            .map(|w| {
                (
                    all_points.slice(s![w[0]..w[1], ..]).to_owned(),
                    all_descs.slice(s![w[0]..w[1], ..]).to_owned(),
                )
            })
            .unzip();

        Self::new(pair_id, source_patches, source_descs, target_patch, target_descs, rmsds)
    }

    /// Reads the five-file `.npy` layout.
    ///
    /// Source patches and their descriptors are usually ragged object arrays, one block per
    /// candidate. Dense `(n, P, 3)` / `(n, P, D)` arrays are accepted too, and every one of their
    /// `P` rows counts as a point.
    pub fn load_legacy(dir: &Path) -> Result<Self> {
        let pair_id = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let source_patches = read_blocks(&dir.join(legacy::SOURCE_PATCHES))?;
        let target_patch: Array2<f32> = read_f32(&dir.join(legacy::TARGET_PATCH))?;
        let source_descs = read_blocks(&dir.join(legacy::SOURCE_DESCS))?;
        let target_descs: Array2<f32> = read_f32(&dir.join(legacy::TARGET_DESCS))?;
        let rmsds: Array1<f32> = read_f32(&dir.join(legacy::SOURCE_RMSDS))?;

        Self::new(pair_id, source_patches, source_descs, target_patch, target_descs, rmsds)
    }

    /// Writes `pair.safetensors` into `dir`, creating the directory if needed.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        self.validate()?;
        fs::create_dir_all(dir).map_err(SurfScoreError::io(dir))?;
        let path = dir.join(RECORD_FILE);

        let dim = self.descriptor_dim();
        let total: usize = self.source_patches.iter().map(|p| p.nrows()).sum();
        let mut offsets = Vec::with_capacity(self.n_candidates() + 1);
        let mut running = 0i64;
        offsets.push(running);
        for patch in &self.source_patches {
            running += patch.nrows() as i64;
            offsets.push(running);
        }

        let tensors = [
            (
                "source_points",
                RawTensor::f32(vec![total, 3], self.source_patches.iter().flatten()),
            ),
            (
                "source_offsets",
                RawTensor::i64(vec![offsets.len()], offsets),
            ),
            (
                "source_descs",
                RawTensor::f32(vec![total, dim], self.source_descs.iter().flatten()),
            ),
            (
                "target_points",
                RawTensor::f32(vec![self.target_patch.nrows(), 3], self.target_patch.iter()),
            ),
            (
                "target_descs",
                RawTensor::f32(vec![self.target_descs.nrows(), dim], self.target_descs.iter()),
            ),
            (
                "rmsds",
                RawTensor::f32(vec![self.n_candidates()], self.source_patch_rmsds.iter()),
            ),
        ];
        let metadata = HashMap::from([
            ("format".to_string(), RECORD_FORMAT.to_string()),
            ("schema_version".to_string(), SCHEMA_VERSION.to_string()),
            ("pair_id".to_string(), self.pair_id.clone()),
        ]);
        write_file(&path, &tensors, metadata)?;
        Ok(path)
    }
}

fn into_2d(file: &TensorFile, name: &str, arr: ndarray::ArrayD<f32>) -> Result<Array2<f32>> {
    arr.into_dimensionality::<Ix2>()
        .map_err(|e| file.schema_error(format!("tensor `{name}`: {e}")))
}

/// Reads one block per candidate from a ragged object array or a dense three-dimensional array.
fn read_blocks(path: &Path) -> Result<Vec<Array2<f32>>> {
    let bytes = fs::read(path).map_err(SurfScoreError::io(path))?;
    if ragged::is_object_array(&bytes) {
        return ragged::decode_ragged(&bytes).map_err(|source| SurfScoreError::RaggedNpy {
            path: path.to_path_buf(),
            source,
        });
    }
    let dense: Array3<f32> = read_f32(path)?;
    Ok(dense.axis_iter(Axis(0)).map(|block| block.to_owned()).collect())
}

/// Reads an f32 `.npy` array, accepting f64 files as well.
fn read_f32<D: Dimension>(path: &Path) -> Result<Array<f32, D>> {
    let npy_error = |source| SurfScoreError::Npy {
        path: path.to_path_buf(),
        source,
    };
    match read_npy::<_, Array<f32, D>>(path) {
        Ok(arr) => Ok(arr),
        Err(ReadNpyError::WrongDescriptor(_)) => read_npy::<_, Array<f64, D>>(path)
            .map(|arr| arr.mapv(|v| v as f32))
            .map_err(npy_error),
        Err(source) => Err(npy_error(source)),
    }
}
