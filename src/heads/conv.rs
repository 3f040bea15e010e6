//! 1-D convolutional head over pooled flat features

use super::{ConvHeadConfig, HeadModule, HeadTrace};
use crate::error::{AdaptationError, Result};
use crate::nn::{
    avg_pool1d, avg_pool1d_backward, global_avg_pool, global_avg_pool_backward, ActivationType, Conv1d, Dense,
    Initializer, ParamSet,
};
use ndarray::{Array2, Array3, Ix3};
use rand::Rng;

/// Treats the (optionally pooled) feature vector as a one-channel sequence:
/// `[batch, features] -> [batch, 1, features]`, runs conv+ReLU blocks, pools
/// over the sequence and finishes with a dense layer.
#[derive(Debug, Clone)]
pub struct ConvHead {
    name: String,
    input_dim: usize,
    pool_size: usize,
    seq_len: usize,
    blocks: Vec<Conv1d>,
    output: Dense,
    output_activation: ActivationType,
}

impl ConvHead {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        output_activation: ActivationType,
        config: &ConvHeadConfig,
    ) -> Self {
        let name = name.into();
        let pool_size = config.input_avg_pool_size.max(1);
        let seq_len = (input_dim / pool_size.min(input_dim)).max(1);
        let num_layers = config.num_layers.max(1);

        let blocks = (0..num_layers)
            .map(|i| {
                let in_channels = if i == 0 { 1 } else { config.num_hidden_filters };
                Conv1d::same(
                    format!("{}.conv{}", name, i),
                    in_channels,
                    config.num_hidden_filters,
                    config.kernel_size,
                )
            })
            .collect();
        let output = Dense::new(format!("{}.out", name), config.num_hidden_filters, output_dim);

        Self {
            name,
            input_dim,
            pool_size,
            seq_len,
            blocks,
            output,
            output_activation,
        }
    }
}

impl HeadModule for ConvHead {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn output_dim(&self) -> usize {
        self.output.output_size
    }

    fn num_params(&self) -> usize {
        self.blocks.iter().map(Conv1d::num_params).sum::<usize>() + self.output.num_params()
    }

    fn init_params<R: Rng + ?Sized>(&self, params: &mut ParamSet, rng: &mut R) -> Result<()> {
        for block in &self.blocks {
            block.init_params(Initializer::Kaiming, params, rng)?;
        }
        self.output.init_params(Initializer::Uniform, params, rng)
    }

    /// Saved slots: block inputs and pre-activations in pairs, then the
    /// pooled vector and the output pre-activation.
    fn forward(&self, params: &ParamSet, input: &Array2<f64>) -> Result<HeadTrace> {
        if input.ncols() != self.input_dim {
            return Err(AdaptationError::config(format!(
                "head '{}' expects {} features, got {}",
                self.name,
                self.input_dim,
                input.ncols()
            )));
        }
        let pooled = if self.pool_size > 1 {
            avg_pool1d(input, self.pool_size)
        } else {
            input.clone()
        };
        let batch_size = pooled.nrows();
        let mut sequence = Array3::from_shape_fn((batch_size, 1, self.seq_len), |(b, _, l)| pooled[[b, l]]);

        let mut saved = Vec::with_capacity(self.blocks.len() * 2 + 2);
        for block in &self.blocks {
            let pre = block.forward(params, &sequence)?;
            let next = ActivationType::ReLU.forward(&pre);
            saved.push(sequence.into_dyn());
            saved.push(pre.into_dyn());
            sequence = next;
        }

        let summary = global_avg_pool(&sequence);
        let pre = self.output.forward(params, &summary)?;
        let output = self.output_activation.forward(&pre);
        saved.push(summary.into_dyn());
        saved.push(pre.into_dyn());
        Ok(HeadTrace::new(output, saved))
    }

    fn backward(
        &self,
        params: &ParamSet,
        trace: &HeadTrace,
        output_gradient: &Array2<f64>,
        grads: &mut ParamSet,
    ) -> Result<Array2<f64>> {
        let n = self.blocks.len();
        let summary = trace.saved2(2 * n)?;
        let pre = trace.saved2(2 * n + 1)?;

        let delta = self.output_activation.backward(&pre, output_gradient);
        let grad_summary = self.output.backward(params, &summary, &delta, grads)?;
        let mut grad = global_avg_pool_backward(self.seq_len, &grad_summary);

        for (i, block) in self.blocks.iter().enumerate().rev() {
            let block_input = trace.saved(2 * i)?.clone().into_dimensionality::<Ix3>()?;
            let block_pre = trace.saved(2 * i + 1)?.clone().into_dimensionality::<Ix3>()?;
            let delta = ActivationType::ReLU.backward(&block_pre, &grad);
            grad = block.backward(params, &block_input, &delta, grads)?;
        }

        let batch_size = grad.dim().0;
        let grad_pooled: Array2<f64> = grad.into_shape((batch_size, self.seq_len))?;
        if self.pool_size > 1 {
            Ok(avg_pool1d_backward(self.input_dim, self.pool_size, &grad_pooled))
        } else {
            Ok(grad_pooled)
        }
    }
}
