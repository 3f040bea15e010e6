//! Small trainable multi-modality encoder
//!
//! One MLP tower per supported modality: the flattened input goes through
//! `hidden_dims` and out to `product(feature_shape)` values, which are then
//! reshaped to `[batch, feature_shape...]`.

use super::Backbone;
use crate::data::{Modality, ShapeDict};
use crate::error::{AdaptationError, Result};
use crate::nn::{ActivationType, Dense, Initializer, ParamSet};
use ndarray::{Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Configuration for [`DenseBackbone`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Hidden layer widths of every tower
    pub hidden_dims: Vec<usize>,
    /// Per-example feature shape produced for every modality
    pub feature_shape: Vec<usize>,
    pub activation: ActivationType,
    /// Seed for weight initialisation
    pub seed: u64,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![128],
            feature_shape: vec![64],
            activation: ActivationType::ReLU,
            seed: 42,
        }
    }
}

impl BackboneConfig {
    pub fn new(hidden_dims: Vec<usize>, feature_shape: Vec<usize>) -> Self {
        Self {
            hidden_dims,
            feature_shape,
            ..Default::default()
        }
    }

    /// Builder pattern: set activation
    pub fn with_activation(mut self, activation: ActivationType) -> Self {
        self.activation = activation;
        self
    }

    /// Builder pattern: set seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Debug, Clone)]
struct Tower {
    input_shape: Vec<usize>,
    layers: Vec<Dense>,
}

/// Dense encoder with one tower per modality in the input shape dict
#[derive(Debug, Clone)]
pub struct DenseBackbone {
    config: BackboneConfig,
    towers: BTreeMap<Modality, Tower>,
    params: ParamSet,
}

impl DenseBackbone {
    pub fn new(config: BackboneConfig, input_shapes: &ShapeDict) -> Result<Self> {
        if input_shapes.is_empty() {
            return Err(AdaptationError::config("dense backbone needs at least one input modality"));
        }
        let feature_dim: usize = config.feature_shape.iter().product();
        if config.feature_shape.is_empty() || feature_dim == 0 {
            return Err(AdaptationError::config(format!(
                "invalid backbone feature shape {:?}",
                config.feature_shape
            )));
        }
        if config.hidden_dims.iter().any(|&d| d == 0) {
            return Err(AdaptationError::config("backbone hidden widths must be positive"));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut params = ParamSet::new();
        let mut towers = BTreeMap::new();

        for (&modality, shape) in input_shapes {
            let input_dim = shape.num_elements();
            if input_dim == 0 {
                return Err(AdaptationError::config(format!("empty input shape for '{}'", modality)));
            }
            let mut dims = vec![input_dim];
            dims.extend(&config.hidden_dims);
            dims.push(feature_dim);

            let layers: Vec<Dense> = dims
                .windows(2)
                .enumerate()
                .map(|(i, pair)| Dense::new(format!("{}.layer{}", modality, i), pair[0], pair[1]))
                .collect();
            for layer in &layers {
                layer.init_params(Initializer::Xavier, &mut params, &mut rng)?;
            }
            towers.insert(
                modality,
                Tower {
                    input_shape: shape.dims.clone(),
                    layers,
                },
            );
        }

        debug!(
            modalities = towers.len(),
            num_params = params.num_elements(),
            "Built dense backbone"
        );

        Ok(Self { config, towers, params })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    fn tower(&self, modality: Modality) -> Result<&Tower> {
        self.towers
            .get(&modality)
            .ok_or_else(|| AdaptationError::Backbone(format!("no tower for the '{}' modality", modality)))
    }

    fn flatten(tower: &Tower, modality: Modality, input: &ArrayD<f64>) -> Result<Array2<f64>> {
        let shape = input.shape();
        if shape.len() < 2 || shape[1..] != tower.input_shape[..] {
            return Err(AdaptationError::ShapeMismatch {
                modality,
                expected: tower.input_shape.clone(),
                actual: shape.get(1..).map(<[usize]>::to_vec).unwrap_or_default(),
            });
        }
        let batch_size = shape[0];
        let width: usize = tower.input_shape.iter().product();
        Ok(input.as_standard_layout().into_owned().into_shape((batch_size, width))?)
    }

    fn activation_for(&self, tower: &Tower, layer: usize) -> ActivationType {
        if layer + 1 == tower.layers.len() {
            ActivationType::Linear
        } else {
            self.config.activation
        }
    }

    /// Returns the final output and `(input, pre_activation)` per layer
    fn run(
        &self,
        params: &ParamSet,
        modality: Modality,
        input: &ArrayD<f64>,
    ) -> Result<(Array2<f64>, Vec<(Array2<f64>, Array2<f64>)>)> {
        let tower = self.tower(modality)?;
        let mut hidden = Self::flatten(tower, modality, input)?;
        let mut cache = Vec::with_capacity(tower.layers.len());
        for (i, layer) in tower.layers.iter().enumerate() {
            let pre = layer.forward(params, &hidden)?;
            let next = self.activation_for(tower, i).forward(&pre);
            cache.push((hidden, pre));
            hidden = next;
        }
        Ok((hidden, cache))
    }
}

impl Backbone for DenseBackbone {
    fn name(&self) -> &str {
        "dense"
    }

    fn supports(&self, modality: Modality) -> bool {
        self.towers.contains_key(&modality)
    }

    fn parameters(&self) -> &ParamSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn forward(&self, params: &ParamSet, modality: Modality, input: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        let (output, _) = self.run(params, modality, input)?;
        let mut dims = vec![output.nrows()];
        dims.extend(&self.config.feature_shape);
        Ok(output.into_shape(IxDyn(&dims))?)
    }

    fn backward(
        &self,
        params: &ParamSet,
        modality: Modality,
        input: &ArrayD<f64>,
        grad_features: &ArrayD<f64>,
    ) -> Result<ParamSet> {
        let tower = self.tower(modality)?;
        let (output, cache) = self.run(params, modality, input)?;
        let mut grad: Array2<f64> = grad_features
            .as_standard_layout()
            .into_owned()
            .into_shape(output.raw_dim())?;

        let mut grads = ParamSet::new();
        for (i, layer) in tower.layers.iter().enumerate().rev() {
            let (layer_input, pre) = &cache[i];
            let delta = self.activation_for(tower, i).backward(pre, &grad);
            grad = layer.backward(params, layer_input, &delta, &mut grads)?;
        }
        Ok(grads)
    }
}
