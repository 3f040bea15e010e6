//! Named parameter tensors, gradients and working copies

use crate::error::{AdaptationError, Result};
use ndarray::{ArrayD, ArrayView1, ArrayView2, ArrayView3, Ix1, Ix2, Ix3};
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

/// Ordered collection of named parameter tensors.
///
/// Heads and backbones never own their weights directly; they read them from a
/// `ParamSet` passed into `forward`/`backward`. That is what lets MAML run the
/// same network against a cloned working copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    tensors: BTreeMap<String, ArrayD<f64>>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f64>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f64>> {
        self.tensors.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.tensors.keys().cloned().collect()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArrayD<f64>> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, String, ArrayD<f64>> {
        self.tensors.iter_mut()
    }

    /// Total scalar count
    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    /// `self += alpha * other` over names present in both.
    /// Names only in `other` are ignored.
    pub fn add_scaled(&mut self, other: &ParamSet, alpha: f64) {
        for (name, tensor) in self.tensors.iter_mut() {
            if let Some(delta) = other.tensors.get(name) {
                tensor.scaled_add(alpha, delta);
            }
        }
    }

    /// `self += other`, inserting names that are missing
    pub fn accumulate(&mut self, other: &ParamSet) {
        for (name, delta) in &other.tensors {
            match self.tensors.get_mut(name) {
                Some(tensor) => *tensor += delta,
                None => {
                    self.tensors.insert(name.clone(), delta.clone());
                }
            }
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for tensor in self.tensors.values_mut() {
            tensor.mapv_inplace(|v| v * factor);
        }
    }

    /// Sum of elementwise products over shared names
    pub fn dot(&self, other: &ParamSet) -> f64 {
        self.tensors
            .iter()
            .filter_map(|(name, a)| other.tensors.get(name).map(|b| (a * b).sum()))
            .sum()
    }

    pub fn is_finite(&self) -> bool {
        self.tensors.values().all(|t| t.iter().all(|v| v.is_finite()))
    }

    /// Largest absolute elementwise difference over shared names
    pub fn max_abs_diff(&self, other: &ParamSet) -> f64 {
        self.tensors
            .iter()
            .filter_map(|(name, a)| {
                other
                    .tensors
                    .get(name)
                    .map(|b| (a - b).iter().fold(0.0f64, |m, v| m.max(v.abs())))
            })
            .fold(0.0, f64::max)
    }

    /// Restrict to names in `keep`
    pub fn filtered(&self, keep: &BTreeSet<String>) -> ParamSet {
        Self {
            tensors: self
                .tensors
                .iter()
                .filter(|(k, _)| keep.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn require(&self, name: &str) -> Result<&ArrayD<f64>> {
        self.tensors
            .get(name)
            .ok_or_else(|| AdaptationError::config(format!("missing parameter '{}'", name)))
    }

    pub fn view1(&self, name: &str) -> Result<ArrayView1<'_, f64>> {
        Ok(self.require(name)?.view().into_dimensionality::<Ix1>()?)
    }

    pub fn view2(&self, name: &str) -> Result<ArrayView2<'_, f64>> {
        Ok(self.require(name)?.view().into_dimensionality::<Ix2>()?)
    }

    pub fn view3(&self, name: &str) -> Result<ArrayView3<'_, f64>> {
        Ok(self.require(name)?.view().into_dimensionality::<Ix3>()?)
    }
}

impl FromIterator<(String, ArrayD<f64>)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f64>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Gradients produced by a step, split by owner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gradients {
    /// Gradients for head parameters (names as in the scheme's head `ParamSet`)
    pub heads: ParamSet,
    /// Gradients for backbone parameters; empty while the backbone is frozen
    pub backbone: ParamSet,
}

impl Gradients {
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty() && self.backbone.is_empty()
    }

    pub fn accumulate(&mut self, other: &Gradients) {
        self.heads.accumulate(&other.heads);
        self.backbone.accumulate(&other.backbone);
    }

    pub fn scale(&mut self, factor: f64) {
        self.heads.scale(factor);
        self.backbone.scale(factor);
    }

    pub fn is_finite(&self) -> bool {
        self.heads.is_finite() && self.backbone.is_finite()
    }

    pub fn dot(&self, other: &Gradients) -> f64 {
        self.heads.dot(&other.heads) + self.backbone.dot(&other.backbone)
    }

    pub fn global_norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// `self += alpha * other`, inserting missing names
    pub fn add_scaled(&mut self, other: &Gradients, alpha: f64) {
        let mut scaled = other.clone();
        scaled.scale(alpha);
        self.accumulate(&scaled);
    }

    /// Largest absolute elementwise difference
    pub fn max_abs_diff(&self, other: &Gradients) -> f64 {
        self.heads
            .max_abs_diff(&other.heads)
            .max(self.backbone.max_abs_diff(&other.backbone))
    }
}

/// Parameters a scheme evaluates with: head weights plus an optional backbone
/// working copy. `backbone: None` means "read the shared backbone's own
/// parameters", which is the frozen case.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub heads: ParamSet,
    pub backbone: Option<ParamSet>,
}

impl ModelParams {
    pub fn new(heads: ParamSet, backbone: Option<ParamSet>) -> Self {
        Self { heads, backbone }
    }

    /// One plain gradient-descent step: `theta -= lr * grad`
    pub fn descend(&mut self, gradients: &Gradients, lr: f64) {
        self.heads.add_scaled(&gradients.heads, -lr);
        if let Some(backbone) = self.backbone.as_mut() {
            backbone.add_scaled(&gradients.backbone, -lr);
        }
    }

    /// Copy displaced by `eps * direction`
    pub fn offset(&self, direction: &Gradients, eps: f64) -> ModelParams {
        let mut moved = self.clone();
        moved.heads.add_scaled(&direction.heads, eps);
        if let Some(backbone) = moved.backbone.as_mut() {
            backbone.add_scaled(&direction.backbone, eps);
        }
        moved
    }
}
