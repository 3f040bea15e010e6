//! Multi-layer perceptron head with optional input pooling

use super::{HeadModule, HeadTrace, MlpHeadConfig};
use crate::error::Result;
use crate::nn::{avg_pool1d, avg_pool1d_backward, ActivationType, Dense, Initializer, ParamSet};
use ndarray::Array2;
use rand::Rng;

/// Stack of dense layers. Hidden layers use `hidden_activation`, the last one
/// uses the output activation chosen at build time.
#[derive(Debug, Clone)]
pub struct MlpHead {
    name: String,
    input_dim: usize,
    pool_size: usize,
    layers: Vec<Dense>,
    hidden_activation: ActivationType,
    output_activation: ActivationType,
}

impl MlpHead {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        output_activation: ActivationType,
        config: &MlpHeadConfig,
    ) -> Self {
        let name = name.into();
        let pool_size = config.input_avg_pool_size.max(1);
        let pooled_dim = (input_dim / pool_size.min(input_dim)).max(1);
        let num_layers = config.num_layers.max(1);

        let mut layers = Vec::with_capacity(num_layers);
        let mut in_dim = pooled_dim;
        for i in 0..num_layers {
            let out_dim = if i + 1 == num_layers {
                output_dim
            } else {
                config.num_hidden_filters
            };
            layers.push(Dense::new(format!("{}.layer{}", name, i), in_dim, out_dim));
            in_dim = out_dim;
        }

        Self {
            name,
            input_dim,
            pool_size,
            layers,
            hidden_activation: config.hidden_activation,
            output_activation,
        }
    }

    fn activation_for(&self, layer: usize) -> ActivationType {
        if layer + 1 == self.layers.len() {
            self.output_activation
        } else {
            self.hidden_activation
        }
    }
}

impl HeadModule for MlpHead {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn output_dim(&self) -> usize {
        self.layers.last().map(|l| l.output_size).unwrap_or(0)
    }

    fn num_params(&self) -> usize {
        self.layers.iter().map(Dense::num_params).sum()
    }

    fn init_params<R: Rng + ?Sized>(&self, params: &mut ParamSet, rng: &mut R) -> Result<()> {
        for layer in &self.layers {
            layer.init_params(Initializer::Kaiming, params, rng)?;
        }
        Ok(())
    }

    /// Saved slots: `[layer_input_0, pre_0, layer_input_1, pre_1, ...]`
    fn forward(&self, params: &ParamSet, input: &Array2<f64>) -> Result<HeadTrace> {
        let mut hidden = if self.pool_size > 1 {
            avg_pool1d(input, self.pool_size)
        } else {
            input.clone()
        };
        let mut saved = Vec::with_capacity(self.layers.len() * 2);
        for (i, layer) in self.layers.iter().enumerate() {
            let pre = layer.forward(params, &hidden)?;
            let next = self.activation_for(i).forward(&pre);
            saved.push(hidden.into_dyn());
            saved.push(pre.into_dyn());
            hidden = next;
        }
        Ok(HeadTrace::new(hidden, saved))
    }

    fn backward(
        &self,
        params: &ParamSet,
        trace: &HeadTrace,
        output_gradient: &Array2<f64>,
        grads: &mut ParamSet,
    ) -> Result<Array2<f64>> {
        let mut grad = output_gradient.clone();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let layer_input = trace.saved2(2 * i)?;
            let pre = trace.saved2(2 * i + 1)?;
            let delta = self.activation_for(i).backward(&pre, &grad);
            grad = layer.backward(params, &layer_input, &delta, grads)?;
        }
        if self.pool_size > 1 {
            grad = avg_pool1d_backward(self.input_dim, self.pool_size, &grad);
        }
        Ok(grad)
    }
}
