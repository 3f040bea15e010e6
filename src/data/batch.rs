//! Batches of (input, target) pairs handed over by the data collaborator

use super::Modality;
use crate::error::{AdaptationError, Result};
use ndarray::{Array2, ArrayD, Axis};
use std::collections::BTreeMap;

/// Target values for one modality
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Class labels, one per example
    Classes(Vec<usize>),
    /// Dense regression targets `[batch, dim]`
    Dense(Array2<f64>),
}

impl Target {
    /// Number of examples
    pub fn len(&self) -> usize {
        match self {
            Target::Classes(labels) => labels.len(),
            Target::Dense(values) => values.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class labels, if this is a classification target
    pub fn classes(&self) -> Option<&[usize]> {
        match self {
            Target::Classes(labels) => Some(labels),
            Target::Dense(_) => None,
        }
    }

    /// Keep only the given example indices
    pub fn select(&self, indices: &[usize]) -> Target {
        match self {
            Target::Classes(labels) => Target::Classes(indices.iter().map(|&i| labels[i]).collect()),
            Target::Dense(values) => Target::Dense(values.select(Axis(0), indices)),
        }
    }
}

/// One batch: modality -> input tensor `[batch, dims...]`, modality -> target,
/// and an optional per-example observation mask used for partial observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub inputs: BTreeMap<Modality, ArrayD<f64>>,
    pub targets: BTreeMap<Modality, Target>,
    pub observed: BTreeMap<Modality, Vec<bool>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add an input tensor
    pub fn with_input(mut self, modality: Modality, tensor: ArrayD<f64>) -> Self {
        self.inputs.insert(modality, tensor);
        self
    }

    /// Builder: add a target
    pub fn with_target(mut self, modality: Modality, target: Target) -> Self {
        self.targets.insert(modality, target);
        self
    }

    /// Builder: mark which examples actually observed this modality
    pub fn with_observed(mut self, modality: Modality, mask: Vec<bool>) -> Self {
        self.observed.insert(modality, mask);
        self
    }

    /// Number of examples, taken from the first input (or target)
    pub fn batch_size(&self) -> usize {
        self.inputs
            .values()
            .next()
            .map(|t| t.shape().first().copied().unwrap_or(0))
            .or_else(|| self.targets.values().next().map(Target::len))
            .unwrap_or(0)
    }

    /// Input tensor for a modality
    pub fn input(&self, modality: Modality) -> Result<&ArrayD<f64>> {
        self.inputs
            .get(&modality)
            .ok_or_else(|| AdaptationError::config(format!("batch has no '{}' input", modality)))
    }

    /// Target for a modality
    pub fn target(&self, modality: Modality) -> Result<&Target> {
        self.targets
            .get(&modality)
            .ok_or_else(|| AdaptationError::config(format!("batch has no '{}' target", modality)))
    }

    /// Whether example `index` observed `modality`
    pub fn is_observed(&self, modality: Modality, index: usize) -> bool {
        if !self.inputs.contains_key(&modality) {
            return false;
        }
        self.observed
            .get(&modality)
            .map(|mask| mask.get(index).copied().unwrap_or(false))
            .unwrap_or(true)
    }

    /// Sub-batch with the given example indices, in order
    pub fn select(&self, indices: &[usize]) -> Batch {
        Batch {
            inputs: self
                .inputs
                .iter()
                .map(|(&m, t)| (m, t.select(Axis(0), indices)))
                .collect(),
            targets: self.targets.iter().map(|(&m, t)| (m, t.select(indices))).collect(),
            observed: self
                .observed
                .iter()
                .map(|(&m, mask)| (m, indices.iter().map(|&i| mask.get(i).copied().unwrap_or(false)).collect()))
                .collect(),
        }
    }

    /// Every input, target and observation mask has `batch_size` rows
    pub fn check_consistent(&self) -> Result<()> {
        let size = self.batch_size();
        for (&modality, tensor) in &self.inputs {
            let rows = tensor.shape().first().copied().unwrap_or(0);
            if rows != size {
                let mut expected = tensor.shape().to_vec();
                if let Some(first) = expected.first_mut() {
                    *first = size;
                }
                return Err(AdaptationError::ShapeMismatch {
                    modality,
                    expected,
                    actual: tensor.shape().to_vec(),
                });
            }
        }
        for (modality, target) in &self.targets {
            if target.len() != size {
                return Err(AdaptationError::config(format!(
                    "'{}' target has {} rows for a batch of {}",
                    modality,
                    target.len(),
                    size
                )));
            }
        }
        for (modality, mask) in &self.observed {
            if mask.len() != size {
                return Err(AdaptationError::config(format!(
                    "'{}' observation mask has {} entries for a batch of {}",
                    modality,
                    mask.len(),
                    size
                )));
            }
        }
        Ok(())
    }

    /// Split into the first `n` examples and the rest
    pub fn split_at(&self, n: usize) -> Result<(Batch, Batch)> {
        self.check_consistent()?;
        let size = self.batch_size();
        if n == 0 || n >= size {
            return Err(AdaptationError::config(format!(
                "cannot split a batch of {} examples at {}",
                size, n
            )));
        }
        let head: Vec<usize> = (0..n).collect();
        let tail: Vec<usize> = (n..size).collect();
        Ok((self.select(&head), self.select(&tail)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn sample_batch() -> Batch {
        let inputs = ArrayD::from_shape_fn(IxDyn(&[4, 2]), |idx| (idx[0] * 10 + idx[1]) as f64);
        Batch::new()
            .with_input(Modality::Image, inputs)
            .with_target(Modality::Image, Target::Classes(vec![0, 1, 0, 1]))
            .with_observed(Modality::Image, vec![true, false, true, true])
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(sample_batch().batch_size(), 4);
        assert_eq!(Batch::new().batch_size(), 0);
    }

    #[test]
    fn test_split_at() {
        let (support, query) = sample_batch().split_at(1).unwrap();
        assert_eq!(support.batch_size(), 1);
        assert_eq!(query.batch_size(), 3);
        assert_eq!(query.targets[&Modality::Image], Target::Classes(vec![1, 0, 1]));
        assert_eq!(query.inputs[&Modality::Image][[0, 1]], 11.0);
        assert!(!query.is_observed(Modality::Image, 0));

        assert!(sample_batch().split_at(0).is_err());
        assert!(sample_batch().split_at(4).is_err());
    }

    #[test]
    fn test_split_rejects_ragged_batch() {
        let short_labels = sample_batch().with_target(Modality::Image, Target::Classes(vec![0, 1]));
        assert!(matches!(short_labels.split_at(2), Err(AdaptationError::Configuration(_))));

        let short_mask = sample_batch().with_observed(Modality::Image, vec![true]);
        assert!(short_mask.split_at(2).is_err());

        let short_input = sample_batch().with_input(Modality::Audio, ArrayD::zeros(IxDyn(&[3, 2])));
        match short_input.split_at(2) {
            Err(AdaptationError::ShapeMismatch { modality, expected, actual }) => {
                assert_eq!(modality, Modality::Audio);
                assert_eq!(expected, vec![4, 2]);
                assert_eq!(actual, vec![3, 2]);
            }
            other => panic!("expected a shape mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_modality_is_unobserved() {
        let batch = sample_batch();
        assert!(batch.is_observed(Modality::Image, 0));
        assert!(!batch.is_observed(Modality::Audio, 0));
    }
}
