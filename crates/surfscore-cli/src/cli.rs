use super::commands;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use surfscore_core::{NegativeShortfall, SamplingConfig};
use surfscore_nn::{ModelConfig, TrainConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Overrides for [`SamplingConfig`]; unset flags keep the defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct SamplingArgs {
    /// Positive rows per pair [default: 100]
    #[arg(long)]
    pub n_positives: Option<usize>,
    /// Negative rows per pair, half of them hard negatives [default: 100]
    #[arg(long)]
    pub n_negatives: Option<usize>,
    /// RMSD below which an alignment is positive [default: 5.0]
    #[arg(long)]
    pub max_rmsd: Option<f32>,
    /// Point slots per candidate [default: 200]
    #[arg(long)]
    pub max_npoints: Option<usize>,
    /// Inlier distance threshold in Angstrom [default: 1.5]
    #[arg(long)]
    pub inlier_distance: Option<f32>,
    /// Sampling and shuffling seed [default: 42]
    #[arg(long)]
    pub seed: Option<u64>,
    /// What to do when a pair has too few negatives
    #[arg(long, value_enum, default_value_t = NegativeShortfall::Error)]
    pub negative_shortfall: NegativeShortfall,
}

impl SamplingArgs {
    pub fn config(&self) -> SamplingConfig {
        let defaults = SamplingConfig::default();
        SamplingConfig {
            n_positives: self.n_positives.unwrap_or(defaults.n_positives),
            n_negatives: self.n_negatives.unwrap_or(defaults.n_negatives),
            max_rmsd: self.max_rmsd.unwrap_or(defaults.max_rmsd),
            max_npoints: self.max_npoints.unwrap_or(defaults.max_npoints),
            inlier_distance: self.inlier_distance.unwrap_or(defaults.inlier_distance),
            seed: self.seed.unwrap_or(defaults.seed),
            negative_shortfall: self.negative_shortfall,
        }
    }
}

/// Where the pair directories live.
#[derive(Args, Debug, Clone)]
pub struct PairSource {
    /// Directory holding one sub-directory per protein pair
    #[arg(long, default_value = "transformation_data")]
    pub data_dir: PathBuf,
    /// Pair identifiers to use, one per line
    #[arg(long, default_value = "../lists/training.txt")]
    pub training_list: PathBuf,
}

/// Overrides for [`TrainConfig`] and the network topology.
#[derive(Args, Debug, Clone, Default)]
pub struct TrainArgs {
    /// [default: 50]
    #[arg(long)]
    pub epochs: Option<usize>,
    /// [default: 32]
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// [default: 1e-4]
    #[arg(long)]
    pub learning_rate: Option<f64>,
    /// Fraction of trailing rows held out for validation [default: 0.1]
    #[arg(long)]
    pub validation_split: Option<f64>,
    /// Keep the training rows in assembly order
    #[arg(long)]
    pub no_shuffle: bool,
    /// L2 penalty on hidden dense kernels [default: 0]
    #[arg(long)]
    pub l2: Option<f64>,
    /// Best-checkpoint weights file [default: models/nn_score/trained_model.safetensors]
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// Directory for metrics.jsonl [default: logs/nn_score]
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Network topology as JSON; flags above still apply
    #[arg(long)]
    pub model_config: Option<PathBuf>,
}

impl TrainArgs {
    pub fn train_config(&self, seed: u64) -> TrainConfig {
        let defaults = TrainConfig::default();
        TrainConfig {
            learning_rate: self.learning_rate.unwrap_or(defaults.learning_rate),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            epochs: self.epochs.unwrap_or(defaults.epochs),
            validation_split: self.validation_split.unwrap_or(defaults.validation_split),
            shuffle: !self.no_shuffle,
            seed,
            checkpoint_path: self.checkpoint.clone().unwrap_or(defaults.checkpoint_path),
            log_dir: self.log_dir.clone().unwrap_or(defaults.log_dir),
        }
    }

    pub fn model_config(&self) -> anyhow::Result<ModelConfig> {
        let mut config = match &self.model_config {
            Some(path) => ModelConfig::load_json(path)?,
            None => ModelConfig::default(),
        };
        if let Some(l2) = self.l2 {
            config.l2_regularization = l2;
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a training set file from pair directories
    Assemble {
        #[command(flatten)]
        source: PairSource,
        #[command(flatten)]
        sampling: SamplingArgs,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Train the scoring network
    Train {
        #[command(flatten)]
        source: PairSource,
        /// Train from a previously assembled training set instead of pair directories
        #[arg(long)]
        dataset: Option<PathBuf>,
        /// Also write the freshly assembled training set here
        #[arg(long, conflicts_with = "dataset")]
        save_dataset: Option<PathBuf>,
        #[command(flatten)]
        sampling: SamplingArgs,
        #[command(flatten)]
        training: TrainArgs,
        #[arg(long)]
        cpu: bool,
    },
    /// Rewrite a legacy .npy pair directory as pair.safetensors
    Convert {
        #[arg(long)]
        pair_dir: PathBuf,
        /// Identifier stored in the record [default: directory name]
        #[arg(long)]
        pair_id: Option<String>,
        /// Where to write the record [default: the pair directory]
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Score every candidate alignment of one pair
    Score {
        #[arg(long)]
        pair_dir: PathBuf,
        #[arg(long)]
        weights: PathBuf,
        /// Model config JSON [default: next to the weights]
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        sampling: SamplingArgs,
        #[arg(long)]
        cpu: bool,
    },
}

impl Cli {
    pub fn execute(self) -> anyhow::Result<()> {
        match self.command {
            Commands::Assemble {
                source,
                sampling,
                output,
            } => commands::assemble::execute(&source, &sampling.config(), &output),
            Commands::Train {
                source,
                dataset,
                save_dataset,
                sampling,
                training,
                cpu,
            } => {
                let sampling = sampling.config();
                let train_config = training.train_config(sampling.seed);
                commands::train::execute(commands::train::TrainJob {
                    source,
                    dataset,
                    save_dataset,
                    sampling,
                    model_config: training.model_config()?,
                    train_config,
                    cpu,
                })
            }
            Commands::Convert {
                pair_dir,
                pair_id,
                output_dir,
            } => commands::convert::execute(&pair_dir, pair_id, output_dir.as_deref()),
            Commands::Score {
                pair_dir,
                weights,
                config,
                sampling,
                cpu,
            } => commands::score::execute(
                &pair_dir,
                &weights,
                config.as_deref(),
                &sampling.config(),
                cpu,
            ),
        }
    }
}
