//! Task heads built on top of flattened backbone features
//!
//! Every head maps `[batch, input_dim]` to `[batch, output_dim]` and can
//! backpropagate an output gradient into its own parameters and its input.
//! Parameter names are prefixed with the head name, so several heads can share
//! one [`ParamSet`].

mod config;
mod conv;
mod linear;
mod mlp;
mod resnet;

pub use config::{ConvHeadConfig, HeadConfig, MlpHeadConfig, ResNetBlockHeadConfig};
pub use conv::ConvHead;
pub use linear::LinearHead;
pub use mlp::MlpHead;
pub use resnet::ResNetBlockHead;

use crate::error::Result;
use crate::nn::ParamSet;
use ndarray::{Array2, ArrayD, Ix2};
use rand::Rng;

/// Intermediate values kept from a forward pass for the matching backward pass
#[derive(Debug, Clone)]
pub struct HeadTrace {
    pub output: Array2<f64>,
    saved: Vec<ArrayD<f64>>,
}

impl HeadTrace {
    pub(crate) fn new(output: Array2<f64>, saved: Vec<ArrayD<f64>>) -> Self {
        Self { output, saved }
    }

    pub(crate) fn saved(&self, index: usize) -> Result<&ArrayD<f64>> {
        self.saved
            .get(index)
            .ok_or_else(|| crate::error::AdaptationError::config(format!("head trace has no slot {}", index)))
    }

    pub(crate) fn saved2(&self, index: usize) -> Result<Array2<f64>> {
        Ok(self.saved(index)?.clone().into_dimensionality::<Ix2>()?)
    }
}

/// Shared head behaviour
pub trait HeadModule {
    fn name(&self) -> &str;

    fn input_dim(&self) -> usize;

    fn output_dim(&self) -> usize;

    fn num_params(&self) -> usize;

    /// Insert freshly initialised parameters under this head's prefix
    fn init_params<R: Rng + ?Sized>(&self, params: &mut ParamSet, rng: &mut R) -> Result<()>;

    fn forward(&self, params: &ParamSet, input: &Array2<f64>) -> Result<HeadTrace>;

    /// Accumulate parameter gradients into `grads` and return `dL/dinput`
    fn backward(
        &self,
        params: &ParamSet,
        trace: &HeadTrace,
        output_gradient: &Array2<f64>,
        grads: &mut ParamSet,
    ) -> Result<Array2<f64>>;
}

/// Any of the supported head architectures
#[derive(Debug, Clone)]
pub enum Head {
    Linear(LinearHead),
    Mlp(MlpHead),
    Conv(ConvHead),
    ResNetBlock(ResNetBlockHead),
}

macro_rules! dispatch {
    ($self:ident, $head:ident => $body:expr) => {
        match $self {
            Head::Linear($head) => $body,
            Head::Mlp($head) => $body,
            Head::Conv($head) => $body,
            Head::ResNetBlock($head) => $body,
        }
    };
}

impl HeadModule for Head {
    fn name(&self) -> &str {
        dispatch!(self, h => h.name())
    }

    fn input_dim(&self) -> usize {
        dispatch!(self, h => h.input_dim())
    }

    fn output_dim(&self) -> usize {
        dispatch!(self, h => h.output_dim())
    }

    fn num_params(&self) -> usize {
        dispatch!(self, h => h.num_params())
    }

    fn init_params<R: Rng + ?Sized>(&self, params: &mut ParamSet, rng: &mut R) -> Result<()> {
        dispatch!(self, h => h.init_params(params, rng))
    }

    fn forward(&self, params: &ParamSet, input: &Array2<f64>) -> Result<HeadTrace> {
        dispatch!(self, h => h.forward(params, input))
    }

    fn backward(
        &self,
        params: &ParamSet,
        trace: &HeadTrace,
        output_gradient: &Array2<f64>,
        grads: &mut ParamSet,
    ) -> Result<Array2<f64>> {
        dispatch!(self, h => h.backward(params, trace, output_gradient, grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ActivationType;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn half_sq(y: &Array2<f64>) -> f64 {
        y.mapv(|v| v * v).sum() * 0.5
    }

    /// Compare analytic parameter and input gradients against central differences
    fn check_gradients(config: HeadConfig, output_activation: ActivationType) {
        let mut rng = StdRng::seed_from_u64(17);
        let head = config.build("h", 6, 3, output_activation).unwrap();
        let mut params = ParamSet::new();
        head.init_params(&mut params, &mut rng).unwrap();
        assert_eq!(params.num_elements(), head.num_params());

        let x = Array2::from_shape_fn((2, 6), |(i, j)| ((i * 6 + j) as f64 * 0.37).sin());
        let trace = head.forward(&params, &x).unwrap();
        assert_eq!(trace.output.dim(), (2, 3));

        let mut grads = ParamSet::new();
        let dx = head.backward(&params, &trace, &trace.output, &mut grads).unwrap();
        assert_eq!(grads.names(), params.names());

        let eps = 1e-6;
        for (name, tensor) in params.iter() {
            let at = tensor.len() / 2;
            let mut up = params.clone();
            up.get_mut(name).unwrap().as_slice_mut().unwrap()[at] += eps;
            let mut down = params.clone();
            down.get_mut(name).unwrap().as_slice_mut().unwrap()[at] -= eps;
            let numeric = (half_sq(&head.forward(&up, &x).unwrap().output)
                - half_sq(&head.forward(&down, &x).unwrap().output))
                / (2.0 * eps);
            let analytic = grads.get(name).unwrap().as_slice().unwrap()[at];
            assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-4);
        }

        let mut x_up = x.clone();
        x_up[[1, 4]] += eps;
        let mut x_down = x.clone();
        x_down[[1, 4]] -= eps;
        let numeric = (half_sq(&head.forward(&params, &x_up).unwrap().output)
            - half_sq(&head.forward(&params, &x_down).unwrap().output))
            / (2.0 * eps);
        assert_abs_diff_eq!(dx[[1, 4]], numeric, epsilon = 1e-4);
    }

    #[test]
    fn test_linear_gradients() {
        check_gradients(HeadConfig::Linear, ActivationType::Linear);
    }

    #[test]
    fn test_mlp_gradients() {
        check_gradients(
            HeadConfig::Mlp(MlpHeadConfig {
                num_layers: 3,
                num_hidden_filters: 5,
                input_avg_pool_size: 2,
                hidden_activation: ActivationType::Tanh,
            }),
            ActivationType::Sigmoid,
        );
    }

    #[test]
    fn test_conv_gradients() {
        check_gradients(
            HeadConfig::Conv(ConvHeadConfig {
                num_layers: 2,
                num_hidden_filters: 3,
                kernel_size: 3,
                input_avg_pool_size: 1,
            }),
            ActivationType::Linear,
        );
    }

    #[test]
    fn test_resnet_gradients() {
        check_gradients(
            HeadConfig::ResNetBlock(ResNetBlockHeadConfig { num_hidden_filters: 4 }),
            ActivationType::Tanh,
        );
    }

    #[test]
    fn test_parameter_names_are_prefixed() {
        let mut rng = StdRng::seed_from_u64(1);
        let head = HeadConfig::Linear
            .build("image.mean", 4, 2, ActivationType::Linear)
            .unwrap();
        let mut params = ParamSet::new();
        head.init_params(&mut params, &mut rng).unwrap();
        assert!(params.names().iter().all(|n| n.starts_with("image.mean.")));
    }
}
