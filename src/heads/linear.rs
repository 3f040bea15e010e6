//! Single dense layer head

use super::{HeadModule, HeadTrace};
use crate::error::Result;
use crate::nn::{ActivationType, Dense, Initializer, ParamSet};
use ndarray::Array2;
use rand::Rng;

/// `activation(x W + b)`
#[derive(Debug, Clone)]
pub struct LinearHead {
    name: String,
    layer: Dense,
    output_activation: ActivationType,
}

impl LinearHead {
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize, output_activation: ActivationType) -> Self {
        let name = name.into();
        Self {
            layer: Dense::new(format!("{}.linear", name), input_dim, output_dim),
            name,
            output_activation,
        }
    }
}

impl HeadModule for LinearHead {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_dim(&self) -> usize {
        self.layer.input_size
    }

    fn output_dim(&self) -> usize {
        self.layer.output_size
    }

    fn num_params(&self) -> usize {
        self.layer.num_params()
    }

    fn init_params<R: Rng + ?Sized>(&self, params: &mut ParamSet, rng: &mut R) -> Result<()> {
        self.layer.init_params(Initializer::Uniform, params, rng)
    }

    fn forward(&self, params: &ParamSet, input: &Array2<f64>) -> Result<HeadTrace> {
        let pre = self.layer.forward(params, input)?;
        let output = self.output_activation.forward(&pre);
        Ok(HeadTrace::new(output, vec![input.clone().into_dyn(), pre.into_dyn()]))
    }

    fn backward(
        &self,
        params: &ParamSet,
        trace: &HeadTrace,
        output_gradient: &Array2<f64>,
        grads: &mut ParamSet,
    ) -> Result<Array2<f64>> {
        let input = trace.saved2(0)?;
        let pre = trace.saved2(1)?;
        let delta = self.output_activation.backward(&pre, output_gradient);
        self.layer.backward(params, &input, &delta, grads)
    }
}
