//! Elementwise activation functions with derivatives

use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};

/// Activation function types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    /// ReLU activation: max(0, x)
    ReLU,
    /// Leaky ReLU: max(0.01*x, x)
    LeakyReLU,
    /// Tanh activation
    Tanh,
    /// Sigmoid activation
    Sigmoid,
    /// GELU (tanh approximation)
    GELU,
    /// No activation (identity)
    Linear,
}

impl Default for ActivationType {
    fn default() -> Self {
        Self::ReLU
    }
}

const GELU_C: f64 = 0.797_884_560_802_865_4;
const GELU_A: f64 = 0.044715;

impl ActivationType {
    /// Apply to a single value
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            ActivationType::ReLU => x.max(0.0),
            ActivationType::LeakyReLU => {
                if x > 0.0 {
                    x
                } else {
                    0.01 * x
                }
            }
            ActivationType::Tanh => x.tanh(),
            ActivationType::Sigmoid => sigmoid(x),
            ActivationType::GELU => {
                let inner = GELU_C * (x + GELU_A * x.powi(3));
                0.5 * x * (1.0 + inner.tanh())
            }
            ActivationType::Linear => x,
        }
    }

    /// Derivative with respect to the pre-activation value
    pub fn derivative(&self, x: f64) -> f64 {
        match self {
            ActivationType::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationType::LeakyReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.01
                }
            }
            ActivationType::Tanh => 1.0 - x.tanh().powi(2),
            ActivationType::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
            ActivationType::GELU => {
                let inner = GELU_C * (x + GELU_A * x.powi(3));
                let t = inner.tanh();
                let d_inner = GELU_C * (1.0 + 3.0 * GELU_A * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
            }
            ActivationType::Linear => 1.0,
        }
    }

    pub fn forward<D: Dimension>(&self, pre: &Array<f64, D>) -> Array<f64, D> {
        if *self == ActivationType::Linear {
            return pre.clone();
        }
        pre.mapv(|v| self.apply(v))
    }

    /// Chain rule through the activation: `grad_out * f'(pre)`
    pub fn backward<D: Dimension>(&self, pre: &Array<f64, D>, grad_out: &Array<f64, D>) -> Array<f64, D> {
        if *self == ActivationType::Linear {
            return grad_out.clone();
        }
        let mut grad = grad_out.clone();
        grad.zip_mut_with(pre, |g, &p| *g *= self.derivative(p));
        grad
    }
}

/// Logistic sigmoid
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable softplus, `ln(1 + e^x)`
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else if x < -30.0 {
        x.exp()
    } else {
        x.exp().ln_1p()
    }
}
