use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T, E = SurfScoreError> = std::result::Result<T, E>;

/// Errors raised while loading pairs and assembling training data.
#[derive(Error, Debug)]
pub enum SurfScoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not read {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpyError,
    },

    #[error("could not read ragged array {path}: {source}")]
    RaggedNpy {
        path: PathBuf,
        #[source]
        source: crate::ragged::RaggedNpyError,
    },

    #[error("safetensors error in {path}: {source}")]
    SafeTensors {
        path: PathBuf,
        #[source]
        source: safetensors::SafeTensorError,
    },

    /// The file exists but does not follow the expected layout.
    #[error("{path}: {message}")]
    Schema { path: PathBuf, message: String },

    #[error("pair {pair_id}: {n_rmsds} rmsd values for {n_patches} source patches")]
    RmsdCountMismatch {
        pair_id: String,
        n_rmsds: usize,
        n_patches: usize,
    },

    #[error("pair {pair_id}: {message}")]
    ShapeMismatch { pair_id: String, message: String },

    #[error("pair {pair_id}: target patch has no points")]
    EmptyTarget { pair_id: String },

    #[error(
        "pair {pair_id}: source patch {patch} has {npoints} points, more than max_npoints = {max_npoints}"
    )]
    PatchTooLarge {
        pair_id: String,
        patch: usize,
        npoints: usize,
        max_npoints: usize,
    },

    #[error("pair {pair_id}: {source}")]
    Sampling {
        pair_id: String,
        #[source]
        source: SamplingError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] validator::ValidationErrors),

    #[error("no training samples were assembled")]
    EmptyDataset,
}

/// Failures of the per-pair candidate sampler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplingError {
    #[error(
        "insufficient negative population: requested {requested} random negatives, {available} available"
    )]
    InsufficientNegatives { requested: usize, available: usize },
}

impl SurfScoreError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| SurfScoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn safetensors(path: &Path) -> impl FnOnce(safetensors::SafeTensorError) -> Self + '_ {
        move |source| SurfScoreError::SafeTensors {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn schema(path: &Path, message: impl Into<String>) -> Self {
        SurfScoreError::Schema {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    pub(crate) fn shape(pair_id: &str, message: impl Into<String>) -> Self {
        SurfScoreError::ShapeMismatch {
            pair_id: pair_id.to_string(),
            message: message.into(),
        }
    }
}
