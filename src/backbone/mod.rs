//! Backbone adapter interface
//!
//! A backbone turns a modality tensor `[batch, dims...]` into an unstructured
//! feature tensor `[batch, feature_dims...]`. Schemes only ever see the
//! flattened feature width, which they discover with a dummy forward pass at
//! build time.

mod dense;
mod identity;
mod shared;

pub use dense::{BackboneConfig, DenseBackbone};
pub use identity::IdentityBackbone;
pub use shared::{FineTuningClaim, SharedBackbone};

use crate::data::Modality;
use crate::error::{AdaptationError, Result};
use crate::nn::ParamSet;
use ndarray::ArrayD;

/// Feature extractor shared between schemes.
///
/// `forward` and `backward` take the parameter set explicitly so that a
/// scheme can evaluate a working copy (MAML) without touching the weights the
/// backbone owns.
pub trait Backbone: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this backbone can embed `modality`
    fn supports(&self, modality: Modality) -> bool;

    /// Parameters owned by the backbone
    fn parameters(&self) -> &ParamSet;

    fn parameters_mut(&mut self) -> &mut ParamSet;

    /// Features for `input` using `params`
    fn forward(&self, params: &ParamSet, modality: Modality, input: &ArrayD<f64>) -> Result<ArrayD<f64>>;

    /// Parameter gradients given `dL/dfeatures` for the same `input`
    fn backward(
        &self,
        params: &ParamSet,
        modality: Modality,
        input: &ArrayD<f64>,
        grad_features: &ArrayD<f64>,
    ) -> Result<ParamSet>;

    /// Features using the backbone's own parameters
    fn features(&self, modality: Modality, input: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        if !self.supports(modality) {
            return Err(AdaptationError::Backbone(format!(
                "{} does not support the '{}' modality",
                self.name(),
                modality
            )));
        }
        self.forward(self.parameters(), modality, input)
    }

    fn forward_image(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        self.features(Modality::Image, input)
    }

    fn forward_video(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        self.features(Modality::Video, input)
    }

    fn forward_audio(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        self.features(Modality::Audio, input)
    }

    fn forward_text(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        self.features(Modality::Text, input)
    }
}
