//! Shape descriptors reported by tasks and consumed once at build time

use super::{Batch, Modality, Target};
use crate::error::{AdaptationError, Result};
use ndarray::{Array2, ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    /// Integer class labels
    I64,
}

impl Default for DType {
    fn default() -> Self {
        Self::F32
    }
}

/// Shape of one modality without the leading batch dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    pub dims: Vec<usize>,
    #[serde(default)]
    pub dtype: DType,
}

impl ShapeDescriptor {
    /// Float tensor with the given per-example dims
    pub fn new(dims: Vec<usize>) -> Self {
        Self {
            dims,
            dtype: DType::F32,
        }
    }

    /// Class-label output with `num_classes` classes
    pub fn classes(num_classes: usize) -> Self {
        Self {
            dims: vec![num_classes],
            dtype: DType::I64,
        }
    }

    /// Dense regression output
    pub fn dense(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }

    /// Number of elements per example
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Whether an output with this descriptor is a classification target
    pub fn is_classification(&self) -> bool {
        self.dtype == DType::I64
    }
}

/// Mapping modality -> shape descriptor
pub type ShapeDict = BTreeMap<Modality, ShapeDescriptor>;

/// Look up a modality, failing with a configuration error when absent
pub fn require_shape<'a>(shapes: &'a ShapeDict, modality: Modality, what: &str) -> Result<&'a ShapeDescriptor> {
    let shape = shapes.get(&modality).ok_or_else(|| {
        AdaptationError::config(format!("{} shape dict has no entry for '{}'", what, modality))
    })?;
    if shape.dims.is_empty() || shape.num_elements() == 0 {
        return Err(AdaptationError::config(format!(
            "{} shape for '{}' is empty: {:?}",
            what, modality, shape.dims
        )));
    }
    Ok(shape)
}

/// Random input tensor of shape `[batch_size, dims...]`
pub fn dummy_tensor<R: Rng + ?Sized>(shape: &ShapeDescriptor, batch_size: usize, rng: &mut R) -> ArrayD<f64> {
    let mut dims = Vec::with_capacity(shape.dims.len() + 1);
    dims.push(batch_size);
    dims.extend_from_slice(&shape.dims);
    ArrayD::random_using(IxDyn(&dims), StandardNormal, rng)
}

/// Batch with random inputs and all-zero targets, matching the given shapes.
///
/// This is what a task hands to `build` for shape discovery; it is also a
/// valid input for `inference_step` right after building.
pub fn dummy_batch<R: Rng + ?Sized>(
    input_shapes: &ShapeDict,
    output_shapes: &ShapeDict,
    batch_size: usize,
    rng: &mut R,
) -> Batch {
    let mut batch = Batch::new();
    for (&modality, shape) in input_shapes {
        batch = batch.with_input(modality, dummy_tensor(shape, batch_size, rng));
    }
    for (&modality, shape) in output_shapes {
        let target = if shape.is_classification() {
            Target::Classes(vec![0; batch_size])
        } else {
            Target::Dense(Array2::zeros((batch_size, shape.num_elements())))
        };
        batch = batch.with_target(modality, target);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_require_shape() {
        let mut shapes = ShapeDict::new();
        shapes.insert(Modality::Image, ShapeDescriptor::new(vec![3, 8, 8]));

        assert_eq!(require_shape(&shapes, Modality::Image, "input").unwrap().num_elements(), 192);
        assert!(matches!(
            require_shape(&shapes, Modality::Audio, "input"),
            Err(AdaptationError::Configuration(_))
        ));
    }

    #[test]
    fn test_dummy_batch_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut inputs = ShapeDict::new();
        inputs.insert(Modality::Image, ShapeDescriptor::new(vec![3, 4, 4]));
        let mut outputs = ShapeDict::new();
        outputs.insert(Modality::Image, ShapeDescriptor::classes(10));

        let batch = dummy_batch(&inputs, &outputs, 2, &mut rng);
        assert_eq!(batch.inputs[&Modality::Image].shape(), &[2, 3, 4, 4]);
        assert_eq!(batch.targets[&Modality::Image].len(), 2);
    }
}
