//! Optimization algorithms over named parameter sets
//!
//! - SGD with optional momentum
//! - Adam with optional AMSGrad and L2 weight decay
//!
//! State is keyed by `"{group}/{name}"`, so one optimizer can hold head and
//! backbone parameters side by side.

use crate::error::{AdaptationError, Result};
use crate::nn::ParamSet;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Optimizer trait for parameter updates
pub trait Optimizer: Send + Sync {
    /// Update one tensor in place given its gradient
    fn update(&mut self, key: &str, param: &mut ArrayD<f64>, gradient: &ArrayD<f64>);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// First-moment (momentum) buffer for a state key, if one exists
    fn momentum(&self, key: &str) -> Option<&ArrayD<f64>>;

    /// Number of tensors with state
    fn num_tracked(&self) -> usize;

    /// Update every parameter in `params` whose name is in `tracked` and that
    /// has a gradient. Returns how many tensors were updated.
    fn step(
        &mut self,
        group: &str,
        params: &mut ParamSet,
        gradients: &ParamSet,
        tracked: &BTreeSet<String>,
    ) -> Result<usize> {
        let mut updated = 0;
        for (name, gradient) in gradients.iter() {
            if !tracked.contains(name) {
                continue;
            }
            let param = params
                .get_mut(name)
                .ok_or_else(|| AdaptationError::config(format!("gradient for unknown parameter '{}'", name)))?;
            if param.shape() != gradient.shape() {
                return Err(AdaptationError::config(format!(
                    "gradient shape {:?} does not match parameter '{}' {:?}",
                    gradient.shape(),
                    name,
                    param.shape()
                )));
            }
            self.update(&format!("{}/{}", group, name), param, gradient);
            updated += 1;
        }
        Ok(updated)
    }
}

/// Named optimizer kind with hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OptimizerConfig {
    Adam {
        lr: f64,
        #[serde(default = "default_betas")]
        betas: [f64; 2],
        #[serde(default = "default_eps")]
        eps: f64,
        #[serde(default)]
        weight_decay: f64,
        #[serde(default)]
        amsgrad: bool,
    },
    #[serde(rename = "SGD")]
    Sgd {
        lr: f64,
        #[serde(default)]
        momentum: f64,
        #[serde(default)]
        weight_decay: f64,
    },
}

fn default_betas() -> [f64; 2] {
    [0.9, 0.999]
}

fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::adam(1e-3)
    }
}

impl OptimizerConfig {
    pub fn adam(lr: f64) -> Self {
        Self::Adam {
            lr,
            betas: default_betas(),
            eps: default_eps(),
            weight_decay: 0.0,
            amsgrad: false,
        }
    }

    pub fn sgd(lr: f64, momentum: f64) -> Self {
        Self::Sgd {
            lr,
            momentum,
            weight_decay: 0.0,
        }
    }

    pub fn lr(&self) -> f64 {
        match self {
            Self::Adam { lr, .. } | Self::Sgd { lr, .. } => *lr,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let lr = self.lr();
        if !(lr.is_finite() && lr > 0.0) {
            return Err(AdaptationError::config(format!("learning rate must be positive, got {}", lr)));
        }
        match self {
            Self::Adam {
                betas,
                eps,
                weight_decay,
                ..
            } => {
                if betas.iter().any(|b| !(0.0..1.0).contains(b)) {
                    return Err(AdaptationError::config(format!("Adam betas must be in [0, 1), got {:?}", betas)));
                }
                if *eps <= 0.0 {
                    return Err(AdaptationError::config("Adam eps must be positive"));
                }
                if *weight_decay < 0.0 {
                    return Err(AdaptationError::config("weight decay must be non-negative"));
                }
            }
            Self::Sgd {
                momentum,
                weight_decay,
                ..
            } => {
                if !(0.0..1.0).contains(momentum) {
                    return Err(AdaptationError::config(format!("SGD momentum must be in [0, 1), got {}", momentum)));
                }
                if *weight_decay < 0.0 {
                    return Err(AdaptationError::config("weight decay must be non-negative"));
                }
            }
        }
        Ok(())
    }

    /// Fresh optimizer with empty state
    pub fn build(&self) -> Result<Box<dyn Optimizer>> {
        self.validate()?;
        Ok(match *self {
            Self::Adam {
                lr,
                betas,
                eps,
                weight_decay,
                amsgrad,
            } => Box::new(Adam {
                learning_rate: lr,
                beta1: betas[0],
                beta2: betas[1],
                epsilon: eps,
                weight_decay,
                amsgrad,
                state: BTreeMap::new(),
            }),
            Self::Sgd {
                lr,
                momentum,
                weight_decay,
            } => Box::new(Sgd {
                learning_rate: lr,
                momentum,
                weight_decay,
                velocity: BTreeMap::new(),
            }),
        })
    }
}

/// Stochastic Gradient Descent with optional momentum
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    velocity: BTreeMap<String, ArrayD<f64>>,
}

impl Optimizer for Sgd {
    fn update(&mut self, key: &str, param: &mut ArrayD<f64>, gradient: &ArrayD<f64>) {
        let mut grad = gradient.clone();
        if self.weight_decay > 0.0 {
            grad.scaled_add(self.weight_decay, param);
        }
        if self.momentum > 0.0 {
            let v = self
                .velocity
                .entry(key.to_string())
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            *v = &*v * self.momentum + &grad;
            param.scaled_add(-self.learning_rate, v);
        } else {
            param.scaled_add(-self.learning_rate, &grad);
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn momentum(&self, key: &str) -> Option<&ArrayD<f64>> {
        self.velocity.get(key)
    }

    fn num_tracked(&self) -> usize {
        self.velocity.len()
    }
}

#[derive(Debug, Clone)]
struct AdamState {
    t: i32,
    m: ArrayD<f64>,
    v: ArrayD<f64>,
    v_max: Option<ArrayD<f64>>,
}

/// Adam optimizer (Adaptive Moment Estimation)
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub amsgrad: bool,
    state: BTreeMap<String, AdamState>,
}

impl Optimizer for Adam {
    fn update(&mut self, key: &str, param: &mut ArrayD<f64>, gradient: &ArrayD<f64>) {
        let mut grad = gradient.clone();
        if self.weight_decay > 0.0 {
            grad.scaled_add(self.weight_decay, param);
        }

        let amsgrad = self.amsgrad;
        let state = self.state.entry(key.to_string()).or_insert_with(|| AdamState {
            t: 0,
            m: ArrayD::zeros(param.raw_dim()),
            v: ArrayD::zeros(param.raw_dim()),
            v_max: if amsgrad {
                Some(ArrayD::zeros(param.raw_dim()))
            } else {
                None
            },
        });
        state.t += 1;

        // Biased first and second moment estimates
        state.m = &state.m * self.beta1 + &grad * (1.0 - self.beta1);
        state.v = &state.v * self.beta2 + &(&grad * &grad) * (1.0 - self.beta2);

        let second = match state.v_max.as_mut() {
            Some(v_max) => {
                v_max.zip_mut_with(&state.v, |a, &b| *a = a.max(b));
                v_max.clone()
            }
            None => state.v.clone(),
        };

        let m_hat = &state.m / (1.0 - self.beta1.powi(state.t));
        let v_hat = second / (1.0 - self.beta2.powi(state.t));

        let step = &m_hat / &(v_hat.mapv(f64::sqrt) + self.epsilon);
        param.scaled_add(-self.learning_rate, &step);
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn momentum(&self, key: &str) -> Option<&ArrayD<f64>> {
        self.state.get(key).map(|s| &s.m)
    }

    fn num_tracked(&self) -> usize {
        self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, IxDyn};

    fn single(name: &str, values: Vec<f64>) -> ParamSet {
        std::iter::once((name.to_string(), arr1(&values).into_dyn())).collect()
    }

    #[test]
    fn test_sgd_update() {
        let mut optimizer = OptimizerConfig::sgd(0.01, 0.0).build().unwrap();
        let mut weights = ArrayD::ones(IxDyn(&[3, 2]));
        let gradients = ArrayD::ones(IxDyn(&[3, 2]));
        optimizer.update("w", &mut weights, &gradients);

        assert_abs_diff_eq!(weights[[0, 0]], 0.99, epsilon = 1e-12);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut optimizer = OptimizerConfig::adam(0.1).build().unwrap();
        let mut params = single("w", vec![1.0, -1.0]);
        let grads = single("w", vec![3.0, -0.5]);
        let tracked: BTreeSet<String> = params.names();

        let updated = optimizer.step("heads", &mut params, &grads, &tracked).unwrap();
        assert_eq!(updated, 1);
        // bias-corrected first step is lr * sign(g)
        let w = params.get("w").unwrap();
        assert_abs_diff_eq!(w[[0]], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(w[[1]], -0.9, epsilon = 1e-6);
        assert!(optimizer.momentum("heads/w").is_some());
    }

    #[test]
    fn test_untracked_parameters_are_left_alone() {
        let mut optimizer = OptimizerConfig::adam(0.1).build().unwrap();
        let mut params = single("w", vec![1.0]);
        let grads = single("w", vec![1.0]);

        let updated = optimizer.step("backbone", &mut params, &grads, &BTreeSet::new()).unwrap();
        assert_eq!(updated, 0);
        assert_eq!(params.get("w").unwrap()[[0]], 1.0);
        assert_eq!(optimizer.num_tracked(), 0);
    }

    #[test]
    fn test_amsgrad_and_weight_decay_decrease_loss() {
        let config = OptimizerConfig::Adam {
            lr: 0.05,
            betas: [0.9, 0.999],
            eps: 1e-6,
            weight_decay: 1e-5,
            amsgrad: true,
        };
        let mut optimizer = config.build().unwrap();
        let mut w = arr1(&[2.0]).into_dyn();
        for _ in 0..50 {
            let grad = w.mapv(|x| 2.0 * x);
            optimizer.update("w", &mut w, &grad);
        }
        assert!(w[[0]].abs() < 2.0);
    }

    #[test]
    fn test_validation() {
        assert!(OptimizerConfig::adam(0.0).validate().is_err());
        assert!(OptimizerConfig::sgd(0.1, 1.5).validate().is_err());
        let cfg: OptimizerConfig = serde_json::from_str(r#"{"type":"Adam","lr":0.001,"amsgrad":true}"#).unwrap();
        assert!(cfg.validate().is_ok());
    }
}
