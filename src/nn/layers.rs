//! Functional dense and 1-D convolution layers
//!
//! Layers only describe shapes and parameter names. Weights live in a
//! [`ParamSet`] under `"{name}.weight"` / `"{name}.bias"` and are passed into
//! every forward and backward call.

use super::ParamSet;
use crate::error::{AdaptationError, Result};
use ndarray::{Array1, Array2, Array3, ArrayD, Axis, IxDyn};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How freshly created weights are drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    /// Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in))
    #[default]
    Uniform,
    /// Kaiming/He normal, std = sqrt(2 / fan_in)
    Kaiming,
    /// Xavier/Glorot uniform over fan_in + fan_out
    Xavier,
}

impl Initializer {
    /// Draw a tensor of the given shape
    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], fan_in: usize, fan_out: usize, rng: &mut R) -> Result<ArrayD<f64>> {
        let fan_in = fan_in.max(1) as f64;
        let fan_out = fan_out.max(1) as f64;
        let tensor = match self {
            Initializer::Uniform => {
                let limit = 1.0 / fan_in.sqrt();
                ArrayD::random_using(IxDyn(shape), Uniform::new(-limit, limit), rng)
            }
            Initializer::Kaiming => {
                let normal = Normal::new(0.0, (2.0 / fan_in).sqrt())
                    .map_err(|e| AdaptationError::config(format!("invalid Kaiming std: {}", e)))?;
                ArrayD::random_using(IxDyn(shape), normal, rng)
            }
            Initializer::Xavier => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                ArrayD::random_using(IxDyn(shape), Uniform::new(-limit, limit), rng)
            }
        };
        Ok(tensor)
    }
}

fn weight_key(name: &str) -> String {
    format!("{}.weight", name)
}

fn bias_key(name: &str) -> String {
    format!("{}.bias", name)
}

/// Fully connected layer: `y = x W + b`, `W` is `(input_size, output_size)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dense {
    pub name: String,
    pub input_size: usize,
    pub output_size: usize,
}

impl Dense {
    pub fn new(name: impl Into<String>, input_size: usize, output_size: usize) -> Self {
        Self {
            name: name.into(),
            input_size,
            output_size,
        }
    }

    /// Insert freshly initialised weights and a zero bias
    pub fn init_params<R: Rng + ?Sized>(&self, init: Initializer, params: &mut ParamSet, rng: &mut R) -> Result<()> {
        let weight = init.sample(&[self.input_size, self.output_size], self.input_size, self.output_size, rng)?;
        params.insert(weight_key(&self.name), weight);
        params.insert(bias_key(&self.name), ArrayD::zeros(IxDyn(&[self.output_size])));
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.input_size * self.output_size + self.output_size
    }

    pub fn forward(&self, params: &ParamSet, input: &Array2<f64>) -> Result<Array2<f64>> {
        let weight = params.view2(&weight_key(&self.name))?;
        let bias = params.view1(&bias_key(&self.name))?;
        if input.ncols() != weight.nrows() {
            return Err(AdaptationError::config(format!(
                "layer '{}' expects {} input features, got {}",
                self.name,
                weight.nrows(),
                input.ncols()
            )));
        }
        Ok(input.dot(&weight) + &bias)
    }

    /// Gradients of `forward` given `dL/dy`.
    ///
    /// Weight and bias gradients are accumulated into `grads`; the input
    /// gradient is returned.
    pub fn backward(
        &self,
        params: &ParamSet,
        input: &Array2<f64>,
        output_gradient: &Array2<f64>,
        grads: &mut ParamSet,
    ) -> Result<Array2<f64>> {
        let weight = params.view2(&weight_key(&self.name))?;

        let weight_gradient = input.t().dot(output_gradient);
        let bias_gradient = output_gradient.sum_axis(Axis(0));

        let mut layer_grads = ParamSet::new();
        layer_grads.insert(weight_key(&self.name), weight_gradient.into_dyn());
        layer_grads.insert(bias_key(&self.name), bias_gradient.into_dyn());
        grads.accumulate(&layer_grads);

        Ok(output_gradient.dot(&weight.t()))
    }
}

/// 1-D convolution with stride 1 and symmetric zero padding.
///
/// Weight tensor is `[out_channels, in_channels, kernel_size]`, input and
/// output are `[batch, channels, length]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv1d {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub padding: usize,
}

impl Conv1d {
    /// Length-preserving convolution (`padding = kernel_size / 2`, odd kernels)
    pub fn same(name: impl Into<String>, in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            name: name.into(),
            in_channels,
            out_channels,
            kernel_size,
            padding: kernel_size / 2,
        }
    }

    pub fn init_params<R: Rng + ?Sized>(&self, init: Initializer, params: &mut ParamSet, rng: &mut R) -> Result<()> {
        let fan_in = self.in_channels * self.kernel_size;
        let fan_out = self.out_channels * self.kernel_size;
        let weight = init.sample(&[self.out_channels, self.in_channels, self.kernel_size], fan_in, fan_out, rng)?;
        params.insert(weight_key(&self.name), weight);
        params.insert(bias_key(&self.name), ArrayD::zeros(IxDyn(&[self.out_channels])));
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel_size + self.out_channels
    }

    fn output_len(&self, in_len: usize) -> Result<usize> {
        let padded = in_len + 2 * self.padding;
        if padded < self.kernel_size {
            return Err(AdaptationError::config(format!(
                "conv '{}' kernel {} is longer than padded input {}",
                self.name, self.kernel_size, padded
            )));
        }
        Ok(padded - self.kernel_size + 1)
    }

    /// Input index that output position `ol` and tap `k` read, if inside the input
    fn source_index(&self, ol: usize, k: usize, in_len: usize) -> Option<usize> {
        let idx = (ol + k) as isize - self.padding as isize;
        if idx >= 0 && (idx as usize) < in_len {
            Some(idx as usize)
        } else {
            None
        }
    }

    pub fn forward(&self, params: &ParamSet, input: &Array3<f64>) -> Result<Array3<f64>> {
        let weight = params.view3(&weight_key(&self.name))?;
        let bias = params.view1(&bias_key(&self.name))?;
        let (batch_size, in_channels, in_len) = input.dim();
        if in_channels != self.in_channels {
            return Err(AdaptationError::config(format!(
                "conv '{}' expects {} channels, got {}",
                self.name, self.in_channels, in_channels
            )));
        }
        let out_len = self.output_len(in_len)?;

        let mut output = Array3::zeros((batch_size, self.out_channels, out_len));
        for b in 0..batch_size {
            for oc in 0..self.out_channels {
                for ol in 0..out_len {
                    let mut sum = bias[oc];
                    for ic in 0..self.in_channels {
                        for k in 0..self.kernel_size {
                            if let Some(il) = self.source_index(ol, k, in_len) {
                                sum += input[[b, ic, il]] * weight[[oc, ic, k]];
                            }
                        }
                    }
                    output[[b, oc, ol]] = sum;
                }
            }
        }
        Ok(output)
    }

    /// Accumulates weight and bias gradients into `grads`, returns `dL/dx`
    pub fn backward(
        &self,
        params: &ParamSet,
        input: &Array3<f64>,
        output_gradient: &Array3<f64>,
        grads: &mut ParamSet,
    ) -> Result<Array3<f64>> {
        let weight = params.view3(&weight_key(&self.name))?;
        let (batch_size, _, in_len) = input.dim();
        let out_len = output_gradient.dim().2;

        let mut input_gradient = Array3::zeros(input.raw_dim());
        let mut weight_gradient = Array3::<f64>::zeros(weight.raw_dim());
        let mut bias_gradient = Array1::<f64>::zeros(self.out_channels);

        for b in 0..batch_size {
            for oc in 0..self.out_channels {
                for ol in 0..out_len {
                    let dy = output_gradient[[b, oc, ol]];
                    bias_gradient[oc] += dy;
                    for ic in 0..self.in_channels {
                        for k in 0..self.kernel_size {
                            if let Some(il) = self.source_index(ol, k, in_len) {
                                weight_gradient[[oc, ic, k]] += dy * input[[b, ic, il]];
                                input_gradient[[b, ic, il]] += dy * weight[[oc, ic, k]];
                            }
                        }
                    }
                }
            }
        }

        let mut layer_grads = ParamSet::new();
        layer_grads.insert(weight_key(&self.name), weight_gradient.into_dyn());
        layer_grads.insert(bias_key(&self.name), bias_gradient.into_dyn());
        grads.accumulate(&layer_grads);

        Ok(input_gradient)
    }
}

/// Non-overlapping average pooling over the feature axis of `[batch, len]`.
///
/// A window longer than the input collapses to one column; trailing columns
/// that do not fill a whole window are dropped.
pub fn avg_pool1d(input: &Array2<f64>, window: usize) -> Array2<f64> {
    let (batch_size, len) = input.dim();
    let window = window.clamp(1, len.max(1));
    let out_len = (len / window).max(1);
    Array2::from_shape_fn((batch_size, out_len), |(b, o)| {
        let start = o * window;
        let end = (start + window).min(len);
        let span = input.row(b);
        span.slice(ndarray::s![start..end]).mean().unwrap_or(0.0)
    })
}

/// Gradient of [`avg_pool1d`] back onto the unpooled input
pub fn avg_pool1d_backward(input_len: usize, window: usize, output_gradient: &Array2<f64>) -> Array2<f64> {
    let (batch_size, out_len) = output_gradient.dim();
    let window = window.clamp(1, input_len.max(1));
    let mut grad = Array2::zeros((batch_size, input_len));
    for b in 0..batch_size {
        for o in 0..out_len {
            let start = o * window;
            let end = (start + window).min(input_len);
            let share = output_gradient[[b, o]] / (end - start).max(1) as f64;
            for i in start..end {
                grad[[b, i]] += share;
            }
        }
    }
    grad
}

/// Mean over the length axis: `[batch, channels, len] -> [batch, channels]`
pub fn global_avg_pool(input: &Array3<f64>) -> Array2<f64> {
    let len = input.dim().2.max(1) as f64;
    input.sum_axis(Axis(2)) / len
}

pub fn global_avg_pool_backward(input_len: usize, output_gradient: &Array2<f64>) -> Array3<f64> {
    let (batch_size, channels) = output_gradient.dim();
    let len = input_len.max(1) as f64;
    Array3::from_shape_fn((batch_size, channels, input_len), |(b, c, _)| output_gradient[[b, c]] / len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn loss2(y: &Array2<f64>) -> f64 {
        y.mapv(|v| v * v).sum() * 0.5
    }

    #[test]
    fn test_dense_shapes() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Dense::new("fc", 4, 3);
        let mut params = ParamSet::new();
        layer.init_params(Initializer::Uniform, &mut params, &mut rng).unwrap();

        let out = layer.forward(&params, &Array2::ones((2, 4))).unwrap();
        assert_eq!(out.dim(), (2, 3));
        assert_eq!(layer.num_params(), 15);
        assert_eq!(params.num_elements(), 15);
    }

    #[test]
    fn test_dense_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let layer = Dense::new("fc", 3, 2);
        let mut params = ParamSet::new();
        layer.init_params(Initializer::Xavier, &mut params, &mut rng).unwrap();
        let x = array![[0.3, -1.2, 0.7], [1.1, 0.4, -0.5]];

        let y = layer.forward(&params, &x).unwrap();
        let mut grads = ParamSet::new();
        let dx = layer.backward(&params, &x, &y, &mut grads).unwrap();

        let eps = 1e-6;
        let mut bumped = params.clone();
        bumped.get_mut("fc.weight").unwrap()[[1, 0]] += eps;
        let up = loss2(&layer.forward(&bumped, &x).unwrap());
        bumped.get_mut("fc.weight").unwrap()[[1, 0]] -= 2.0 * eps;
        let down = loss2(&layer.forward(&bumped, &x).unwrap());
        assert_abs_diff_eq!(grads.get("fc.weight").unwrap()[[1, 0]], (up - down) / (2.0 * eps), epsilon = 1e-5);

        let mut x_up = x.clone();
        x_up[[0, 2]] += eps;
        let mut x_down = x.clone();
        x_down[[0, 2]] -= eps;
        let numeric = (loss2(&layer.forward(&params, &x_up).unwrap()) - loss2(&layer.forward(&params, &x_down).unwrap())) / (2.0 * eps);
        assert_abs_diff_eq!(dx[[0, 2]], numeric, epsilon = 1e-5);
    }

    #[test]
    fn test_conv_same_padding_and_gradients() {
        let mut rng = StdRng::seed_from_u64(9);
        let conv = Conv1d::same("conv", 1, 2, 3);
        let mut params = ParamSet::new();
        conv.init_params(Initializer::Kaiming, &mut params, &mut rng).unwrap();
        let x = Array3::from_shape_fn((2, 1, 5), |(b, _, l)| (b as f64 + 1.0) * (l as f64 - 2.0) * 0.3);

        let y = conv.forward(&params, &x).unwrap();
        assert_eq!(y.dim(), (2, 2, 5));

        let mut grads = ParamSet::new();
        let dx = conv.backward(&params, &x, &y, &mut grads).unwrap();
        let total = |p: &ParamSet, input: &Array3<f64>| conv.forward(p, input).unwrap().mapv(|v| v * v).sum() * 0.5;

        let eps = 1e-6;
        let mut up = params.clone();
        up.get_mut("conv.weight").unwrap()[[1, 0, 2]] += eps;
        let mut down = params.clone();
        down.get_mut("conv.weight").unwrap()[[1, 0, 2]] -= eps;
        let numeric = (total(&up, &x) - total(&down, &x)) / (2.0 * eps);
        assert_abs_diff_eq!(grads.get("conv.weight").unwrap()[[1, 0, 2]], numeric, epsilon = 1e-5);

        let mut x_up = x.clone();
        x_up[[1, 0, 0]] += eps;
        let mut x_down = x.clone();
        x_down[[1, 0, 0]] -= eps;
        let numeric = (total(&params, &x_up) - total(&params, &x_down)) / (2.0 * eps);
        assert_abs_diff_eq!(dx[[1, 0, 0]], numeric, epsilon = 1e-5);
    }

    #[test]
    fn test_avg_pool_roundtrip_shapes() {
        let x = array![[1.0, 3.0, 5.0, 7.0, 9.0]];
        let pooled = avg_pool1d(&x, 2);
        assert_eq!(pooled, array![[2.0, 6.0]]);

        let grad = avg_pool1d_backward(5, 2, &array![[1.0, 1.0]]);
        assert_eq!(grad, array![[0.5, 0.5, 0.5, 0.5, 0.0]]);

        assert_eq!(avg_pool1d(&x, 10), array![[5.0]]);
    }

    #[test]
    fn test_global_avg_pool() {
        let x = Array3::from_shape_fn((1, 2, 4), |(_, c, l)| (c * 4 + l) as f64);
        let pooled = global_avg_pool(&x);
        assert_eq!(pooled, array![[1.5, 5.5]]);
        let back = global_avg_pool_backward(4, &array![[4.0, 8.0]]);
        assert_eq!(back[[0, 1, 3]], 2.0);
    }
}
