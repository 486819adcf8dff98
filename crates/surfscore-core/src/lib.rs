//! surfscore-core
//!
//! Training data for the alignment scoring network.
//!
//! - load protein pair records (`pair.safetensors`, or the legacy `.npy` layout, ragged or dense)
//! - match each candidate source patch against the target patch with a KD-tree
//! - build `(max_npoints, 2)` point features and inlier rates per candidate
//! - label and rebalance candidates per pair, then accumulate them into a `TrainingSet`
//!
//! ```ignore
//! use surfscore_core::{assemble_dataset, discover_pairs, read_training_list, SamplingConfig};
//!
//! let training = read_training_list("../lists/training.txt".as_ref())?;
//! let pairs = discover_pairs("transformation_data".as_ref(), &training)?;
//! let (set, report) = assemble_dataset(&pairs, &SamplingConfig::default())?;
//! ```
pub mod config;
pub mod correspondence;
pub mod dataset;
pub mod error;
pub mod kdtree;
pub mod pair;
pub mod ragged;
pub mod sampling;
mod tensors;

pub use config::{NegativeShortfall, SamplingConfig, N_FEATURES};
pub use correspondence::{compute_pair_features, PairFeatures};
pub use dataset::{
    assemble_dataset, discover_pairs, process_pair, read_training_list, AssemblyReport,
    DatasetAccumulator, PairOutcome, TrainingSet,
};
pub use error::{Result, SamplingError, SurfScoreError};
pub use kdtree::KdTree;
pub use pair::PairRecord;
pub use sampling::{select_candidates, CandidateSelection, PairSamples, SampleGroup};
