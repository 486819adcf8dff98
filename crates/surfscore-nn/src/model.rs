use crate::config::ModelConfig;
use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{self as nn, BatchNorm, BatchNormConfig, Conv1d, Conv1dConfig, Linear, VarBuilder};

/// Pointwise convolution, batch normalization, ReLU.
pub struct ConvBlock {
    conv: Conv1d,
    norm: BatchNorm,
}

impl ConvBlock {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        config: &ModelConfig,
    ) -> Result<Self> {
        let conv = nn::conv1d(
            in_channels,
            out_channels,
            1,
            Conv1dConfig::default(),
            vb.pp("conv"),
        )?;
        let bn_conf = BatchNormConfig {
            eps: config.batch_norm_eps,
            remove_mean: true,
            affine: true,
            momentum: config.batch_norm_momentum,
        };
        let norm = nn::batch_norm(out_channels, bn_conf, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        self.norm.forward_t(&xs, train)?.relu()
    }
}

/// Binary alignment classifier over padded per-point features.
///
/// Input is `(batch, max_npoints, in_channels)`, output is `(batch, n_classes)` logits. Padding rows
/// are zeros and take part in the mean pool like any other point.
pub struct ScoreNet {
    blocks: Vec<ConvBlock>,
    dense: Vec<Linear>,
    head: Linear,
    l2_regularization: f64,
}

impl ScoreNet {
    pub fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let ModelConfig {
            in_channels,
            conv_channels,
            dense_units,
            n_classes,
            l2_regularization,
            ..
        } = config;

        let mut blocks = Vec::with_capacity(conv_channels.len());
        let mut width = *in_channels;
        for (i, &out) in conv_channels.iter().enumerate() {
            blocks.push(ConvBlock::load(vb.pp(format!("conv_blocks.{i}")), width, out, config)?);
            width = out;
        }

        let mut dense = Vec::with_capacity(dense_units.len());
        for (i, &units) in dense_units.iter().enumerate() {
            dense.push(nn::linear(width, units, vb.pp(format!("dense.{i}")))?);
            width = units;
        }
        let head = nn::linear(width, *n_classes, vb.pp("head"))?;

        Ok(Self {
            blocks,
            dense,
            head,
            l2_regularization: *l2_regularization,
        })
    }

    /// Sum of squared hidden dense kernels scaled by the L2 factor, or `None` when it is zero.
    pub fn l2_penalty(&self) -> Result<Option<Tensor>> {
        if self.l2_regularization <= 0.0 || self.dense.is_empty() {
            return Ok(None);
        }
        let mut total: Option<Tensor> = None;
        for layer in &self.dense {
            let sq = layer.weight().sqr()?.sum_all()?;
            total = Some(match total {
                Some(t) => (t + sq)?,
                None => sq,
            });
        }
        total
            .map(|t| t.affine(self.l2_regularization, 0.0))
            .transpose()
    }

    /// Class probabilities in inference mode.
    pub fn predict_proba(&self, xs: &Tensor) -> Result<Tensor> {
        nn::ops::softmax(&self.forward_t(xs, false)?, D::Minus1)
    }
}

impl ModuleT for ScoreNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        // (batch, points, channels) -> (batch, channels, points)
        let mut xs = xs.transpose(1, 2)?.contiguous()?;
        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
        }
        let mut xs = xs.mean(D::Minus1)?;
        for layer in &self.dense {
            xs = layer.forward(&xs)?.relu()?;
        }
        self.head.forward(&xs)
    }
}
