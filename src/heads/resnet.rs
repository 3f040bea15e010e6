//! Residual block head

use super::{HeadModule, HeadTrace, ResNetBlockHeadConfig};
use crate::error::Result;
use crate::nn::{ActivationType, Dense, Initializer, ParamSet};
use ndarray::Array2;
use rand::Rng;

/// `h0 = x W_in`, `h = relu(h0 + W2 relu(W1 h0))`, `y = act(h W_out)`
#[derive(Debug, Clone)]
pub struct ResNetBlockHead {
    name: String,
    input_proj: Dense,
    fc1: Dense,
    fc2: Dense,
    output: Dense,
    output_activation: ActivationType,
}

impl ResNetBlockHead {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        output_activation: ActivationType,
        config: &ResNetBlockHeadConfig,
    ) -> Self {
        let name = name.into();
        let hidden = config.num_hidden_filters;
        Self {
            input_proj: Dense::new(format!("{}.in", name), input_dim, hidden),
            fc1: Dense::new(format!("{}.block.fc1", name), hidden, hidden),
            fc2: Dense::new(format!("{}.block.fc2", name), hidden, hidden),
            output: Dense::new(format!("{}.out", name), hidden, output_dim),
            name,
            output_activation,
        }
    }
}

impl HeadModule for ResNetBlockHead {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_dim(&self) -> usize {
        self.input_proj.input_size
    }

    fn output_dim(&self) -> usize {
        self.output.output_size
    }

    fn num_params(&self) -> usize {
        self.input_proj.num_params() + self.fc1.num_params() + self.fc2.num_params() + self.output.num_params()
    }

    fn init_params<R: Rng + ?Sized>(&self, params: &mut ParamSet, rng: &mut R) -> Result<()> {
        self.input_proj.init_params(Initializer::Kaiming, params, rng)?;
        self.fc1.init_params(Initializer::Kaiming, params, rng)?;
        self.fc2.init_params(Initializer::Kaiming, params, rng)?;
        self.output.init_params(Initializer::Uniform, params, rng)
    }

    /// Saved slots: `[x, h0, z1, a1, s, h, out_pre]` where `s = h0 + fc2(a1)`
    fn forward(&self, params: &ParamSet, input: &Array2<f64>) -> Result<HeadTrace> {
        let h0 = self.input_proj.forward(params, input)?;
        let z1 = self.fc1.forward(params, &h0)?;
        let a1 = ActivationType::ReLU.forward(&z1);
        let residual = self.fc2.forward(params, &a1)?;
        let s = &h0 + &residual;
        let h = ActivationType::ReLU.forward(&s);
        let pre = self.output.forward(params, &h)?;
        let output = self.output_activation.forward(&pre);

        let saved = vec![
            input.clone().into_dyn(),
            h0.into_dyn(),
            z1.into_dyn(),
            a1.into_dyn(),
            s.into_dyn(),
            h.into_dyn(),
            pre.into_dyn(),
        ];
        Ok(HeadTrace::new(output, saved))
    }

    fn backward(
        &self,
        params: &ParamSet,
        trace: &HeadTrace,
        output_gradient: &Array2<f64>,
        grads: &mut ParamSet,
    ) -> Result<Array2<f64>> {
        let x = trace.saved2(0)?;
        let h0 = trace.saved2(1)?;
        let z1 = trace.saved2(2)?;
        let a1 = trace.saved2(3)?;
        let s = trace.saved2(4)?;
        let h = trace.saved2(5)?;
        let pre = trace.saved2(6)?;

        let delta = self.output_activation.backward(&pre, output_gradient);
        let grad_h = self.output.backward(params, &h, &delta, grads)?;
        let grad_s = ActivationType::ReLU.backward(&s, &grad_h);

        // skip path and residual path both feed h0
        let grad_a1 = self.fc2.backward(params, &a1, &grad_s, grads)?;
        let grad_z1 = ActivationType::ReLU.backward(&z1, &grad_a1);
        let grad_h0 = &grad_s + &self.fc1.backward(params, &h0, &grad_z1, grads)?;

        self.input_proj.backward(params, &x, &grad_h0, grads)
    }
}
