//! Training set assembly over a directory of protein pairs.
use crate::config::{NegativeShortfall, SamplingConfig, N_FEATURES};
use crate::correspondence::compute_pair_features;
use crate::error::{Result, SamplingError, SurfScoreError};
use crate::pair::PairRecord;
use crate::sampling::{select_candidates, PairSamples, SampleGroup};
use crate::tensors::{write_file, RawTensor, TensorFile};
use ndarray::{Array2, Array3, Ix2, Ix3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use validator::Validate;

pub const DATASET_FORMAT: &str = "surfscore-dataset";
pub const DATASET_SCHEMA_VERSION: u32 = 1;

/// Reads the training list: one pair identifier per line, blank lines ignored.
pub fn read_training_list(path: &Path) -> Result<HashSet<String>> {
    let text = fs::read_to_string(path).map_err(SurfScoreError::io(path))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Pair directories under `data_dir` that hold pair data and are named in `training`, sorted by name.
pub fn discover_pairs(data_dir: &Path, training: &HashSet<String>) -> Result<Vec<PathBuf>> {
    let mut pairs = Vec::new();
    for entry in fs::read_dir(data_dir).map_err(SurfScoreError::io(data_dir))? {
        let path = entry.map_err(SurfScoreError::io(data_dir))?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if training.contains(name) && PairRecord::is_pair_dir(&path) {
            pairs.push(path);
        }
    }
    pairs.sort();
    Ok(pairs)
}

/// Assembled rows, ready for training.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    /// `(n_samples, max_npoints, N_FEATURES)`
    pub features: Array3<f32>,
    /// `(n_samples, 1)`
    pub labels: Array2<u32>,
    /// Position in `pair_ids` of the pair each row came from.
    pub pair_index: Vec<u32>,
    pub groups: Vec<SampleGroup>,
    pub pair_ids: Vec<String>,
}

impl TrainingSet {
    pub fn n_samples(&self) -> usize {
        self.labels.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.n_samples() == 0
    }

    pub fn max_npoints(&self) -> usize {
        self.features.shape()[1]
    }

    pub fn n_positive(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(SurfScoreError::io(parent))?;
        }
        let n = self.n_samples();
        let pair_ids = serde_json::to_string(&self.pair_ids)
            .map_err(|e| SurfScoreError::schema(path, e.to_string()))?;
        let tensors = [
            (
                "features",
                RawTensor::f32(self.features.shape().to_vec(), self.features.iter()),
            ),
            ("labels", RawTensor::u32(vec![n, 1], self.labels.iter())),
            ("pair_index", RawTensor::u32(vec![n], self.pair_index.iter())),
            (
                "groups",
                RawTensor::u8(vec![n], self.groups.iter().map(|g| g.code()).collect()),
            ),
        ];
        let metadata = HashMap::from([
            ("format".to_string(), DATASET_FORMAT.to_string()),
            ("schema_version".to_string(), DATASET_SCHEMA_VERSION.to_string()),
            ("pair_ids".to_string(), pair_ids),
        ]);
        write_file(path, &tensors, metadata)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let buffer = fs::read(path).map_err(SurfScoreError::io(path))?;
        let file = TensorFile::parse(path, &buffer)?;
        file.expect_format(DATASET_FORMAT, DATASET_SCHEMA_VERSION)?;
        let pair_ids: Vec<String> = serde_json::from_str(file.meta("pair_ids")?)
            .map_err(|e| file.schema_error(format!("`pair_ids` metadata: {e}")))?;

        let features = file
            .f32("features")?
            .into_dimensionality::<Ix3>()
            .map_err(|e| file.schema_error(format!("tensor `features`: {e}")))?;
        let labels = file
            .u32("labels")?
            .into_dimensionality::<Ix2>()
            .map_err(|e| file.schema_error(format!("tensor `labels`: {e}")))?;
        let pair_index: Vec<u32> = file.u32("pair_index")?.iter().copied().collect();
        let groups = file
            .u8("groups")?
            .iter()
            .map(|&code| SampleGroup::from_code(code))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| file.schema_error("unknown sample group code"))?;

        let n = labels.nrows();
        if features.shape()[0] != n || pair_index.len() != n || groups.len() != n {
            return Err(file.schema_error("row counts of features, labels, pair_index and groups differ"));
        }
        if pair_index.iter().any(|&i| i as usize >= pair_ids.len()) {
            return Err(file.schema_error("`pair_index` points past `pair_ids`"));
        }
        Ok(Self {
            features,
            labels,
            pair_index,
            groups,
            pair_ids,
        })
    }
}

/// Append-only buffers that grow one pair at a time.
#[derive(Debug)]
pub struct DatasetAccumulator {
    max_npoints: usize,
    features: Vec<f32>,
    labels: Vec<u32>,
    pair_index: Vec<u32>,
    groups: Vec<SampleGroup>,
    pair_ids: Vec<String>,
}

impl DatasetAccumulator {
    pub fn new(max_npoints: usize) -> Self {
        Self {
            max_npoints,
            features: Vec::new(),
            labels: Vec::new(),
            pair_index: Vec::new(),
            groups: Vec::new(),
            pair_ids: Vec::new(),
        }
    }

    pub fn n_samples(&self) -> usize {
        self.labels.len()
    }

    pub fn n_pairs(&self) -> usize {
        self.pair_ids.len()
    }

    pub fn push(&mut self, samples: PairSamples) {
        debug_assert_eq!(samples.features.shape()[1], self.max_npoints);
        debug_assert_eq!(samples.features.shape()[0], samples.labels.len());
        let index = self.pair_ids.len() as u32;
        self.features.extend(samples.features.iter());
        self.pair_index
            .extend(std::iter::repeat(index).take(samples.labels.len()));
        self.labels.extend(samples.labels);
        self.groups.extend(samples.groups);
        self.pair_ids.push(samples.pair_id);
    }

    pub fn finish(self) -> Result<TrainingSet> {
        let n = self.labels.len();
        let shape_error = |e: ndarray::ShapeError| SurfScoreError::shape("<dataset>", e.to_string());
        let features = Array3::from_shape_vec((n, self.max_npoints, N_FEATURES), self.features)
            .map_err(shape_error)?;
        let labels = Array2::from_shape_vec((n, 1), self.labels).map_err(shape_error)?;
        Ok(TrainingSet {
            features,
            labels,
            pair_index: self.pair_index,
            groups: self.groups,
            pair_ids: self.pair_ids,
        })
    }
}

/// What happened to one pair during assembly.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Included { samples: usize },
    NoPositives,
    InsufficientNegatives { requested: usize, available: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssemblyReport {
    pub pairs: Vec<(String, PairOutcome)>,
}

impl AssemblyReport {
    pub fn n_included(&self) -> usize {
        self.pairs
            .iter()
            .filter(|(_, o)| matches!(o, PairOutcome::Included { .. }))
            .count()
    }

    pub fn n_skipped(&self) -> usize {
        self.pairs.len() - self.n_included()
    }

    pub fn n_samples(&self) -> usize {
        self.pairs
            .iter()
            .map(|(_, o)| match o {
                PairOutcome::Included { samples } => *samples,
                _ => 0,
            })
            .sum()
    }
}

/// Features and selected rows for one pair. `Ok(None)` means the pair has no positive candidate.
pub fn process_pair<R: Rng + ?Sized>(
    pair: &PairRecord,
    config: &SamplingConfig,
    rng: &mut R,
) -> Result<Option<PairSamples>> {
    let features = compute_pair_features(pair, config)?;
    let rmsds = pair.source_patch_rmsds.to_vec();
    let selection = select_candidates(&rmsds, &features.inlier_rates, config, rng).map_err(
        |source| SurfScoreError::Sampling {
            pair_id: pair.pair_id.clone(),
            source,
        },
    )?;
    Ok(selection.map(|sel| PairSamples::gather(&pair.pair_id, &features, &sel)))
}

/// Loads and samples every pair in order, with one RNG seeded from `config.seed`.
pub fn assemble_dataset(
    pair_dirs: &[PathBuf],
    config: &SamplingConfig,
) -> Result<(TrainingSet, AssemblyReport)> {
    config.validate()?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut acc = DatasetAccumulator::new(config.max_npoints);
    let mut report = AssemblyReport::default();

    for dir in pair_dirs {
        let pair = PairRecord::load(dir)?;
        let outcome = match process_pair(&pair, config, &mut rng) {
            Ok(Some(samples)) => {
                let n = samples.len();
                acc.push(samples);
                PairOutcome::Included { samples: n }
            }
            Ok(None) => {
                log::info!("skipping {}: no alignment below {} RMSD", pair.pair_id, config.max_rmsd);
                PairOutcome::NoPositives
            }
            Err(SurfScoreError::Sampling {
                pair_id,
                source: SamplingError::InsufficientNegatives { requested, available },
            }) if config.negative_shortfall == NegativeShortfall::Skip => {
                log::warn!(
                    "skipping {pair_id}: {requested} random negatives requested, {available} available"
                );
                PairOutcome::InsufficientNegatives {
                    requested,
                    available,
                }
            }
            Err(e) => return Err(e),
        };
        report.pairs.push((pair.pair_id, outcome));
    }

    log::info!(
        "assembled {} samples from {} of {} pairs",
        acc.n_samples(),
        acc.n_pairs(),
        pair_dirs.len()
    );
    Ok((acc.finish()?, report))
}
