//! surfscore-nn
//!
//! Candle implementation of the alignment scoring network: a stack of pointwise convolutions over
//! the per-point features, average pooled, followed by a small dense classifier.
//!
//! ```shell
//! cargo run -p surfscore-cli -- train --data-dir transformation_data
//! cargo run -p surfscore-cli --features metal -- train --data-dir transformation_data
//! ```
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Result};

pub use config::{ModelConfig, TrainConfig};
pub use model::{ConvBlock, ScoreNet};
pub use scorer::ScoreModel;
pub use trainer::{
    BestCheckpoint, EpochMetrics, Evaluation, History, MetricsLog, Trainer, TrainingCallback,
};

pub mod config;
pub mod metrics;
pub mod model;
pub mod scorer;
pub mod trainer;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            log::info!("running on CPU, build with `--features metal` to train on the GPU");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            log::info!("running on CPU, no CUDA or Metal device found");
        }
        Ok(Device::Cpu)
    }
}
