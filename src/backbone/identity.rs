//! Parameter-free backbone that returns its input

use super::Backbone;
use crate::data::Modality;
use crate::error::Result;
use crate::nn::ParamSet;
use ndarray::ArrayD;
use std::collections::BTreeSet;

/// Passes modality tensors through unchanged. Useful when inputs are already
/// embeddings, and for exercising schemes without a trainable backbone.
#[derive(Debug, Clone)]
pub struct IdentityBackbone {
    modalities: BTreeSet<Modality>,
    params: ParamSet,
}

impl IdentityBackbone {
    /// Supports every modality
    pub fn new() -> Self {
        Self::with_modalities(Modality::all())
    }

    pub fn with_modalities(modalities: impl IntoIterator<Item = Modality>) -> Self {
        Self {
            modalities: modalities.into_iter().collect(),
            params: ParamSet::new(),
        }
    }
}

impl Default for IdentityBackbone {
    fn default() -> Self {
        Self::new()
    }
}

impl Backbone for IdentityBackbone {
    fn name(&self) -> &str {
        "identity"
    }

    fn supports(&self, modality: Modality) -> bool {
        self.modalities.contains(&modality)
    }

    fn parameters(&self) -> &ParamSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn forward(&self, _params: &ParamSet, _modality: Modality, input: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        Ok(input.clone())
    }

    fn backward(
        &self,
        _params: &ParamSet,
        _modality: Modality,
        _input: &ArrayD<f64>,
        _grad_features: &ArrayD<f64>,
    ) -> Result<ParamSet> {
        Ok(ParamSet::new())
    }
}
