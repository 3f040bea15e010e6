//! Adaptation schemes
//!
//! Every way of adapting a shared backbone to a task implements
//! [`AdaptationScheme`]:
//!
//! 1. construct with static hyperparameters
//! 2. `build` with the task's shape dicts (one dummy backbone pass per modality)
//! 3. `train_step` / `eval_step` / `inference_step`, any number of times
//!
//! Step methods take `&self`. A scheme computes gradients; the outer trainer
//! decides when to apply them through `optimizer_step`.

mod common;
mod config;
mod distance;
mod embedding;
mod fine_tuning;
#[cfg(test)]
mod fixtures;
mod maml;
mod matching;
mod poem;
mod poem_metric;
mod prototypical;

pub use common::TrainableSet;
pub use config::{
    FineTuningConfig, LearnerSettings, MamlConfig, MetricConfig, PoemConfig, PoemHeadMetricConfig, SchemeConfig,
};
pub use distance::DistanceMetric;
pub use fine_tuning::{FineTuneScope, FineTuningScheme};
pub use maml::MamlScheme;
pub use matching::MatchingNetworkScheme;
pub use poem::{fuse_experts, ExpertOutput, FusedEstimate, PoemScheme};
pub use poem_metric::PoemHeadMetricScheme;
pub use prototypical::PrototypicalNetworkScheme;

use crate::backbone::SharedBackbone;
use crate::data::{Modality, ShapeDict, TaskBatch};
use crate::error::Result;
use crate::metrics::{MetricMap, MetricSet};
use crate::nn::{ActivationType, Gradients, ParamSet};
use crate::optim::Optimizer;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which algorithm a scheme runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemeKind {
    SingleLinearLayerFineTuning,
    FullModelFineTuning,
    EpisodicMamlSingleLinearLayer,
    EpisodicMamlFullModel,
    PrototypicalNetwork,
    MatchingNetwork,
    PartialObservationExpertsModelling,
    PrototypicalNetworkPoemHead,
    MatchingNetworkPoemHead,
}

impl SchemeKind {
    pub fn name(&self) -> &'static str {
        match self {
            SchemeKind::SingleLinearLayerFineTuning => "SingleLinearLayerFineTuning",
            SchemeKind::FullModelFineTuning => "FullModelFineTuning",
            SchemeKind::EpisodicMamlSingleLinearLayer => "EpisodicMAMLSingleLinearLayer",
            SchemeKind::EpisodicMamlFullModel => "EpisodicMAMLFullModel",
            SchemeKind::PrototypicalNetwork => "EpisodicPrototypicalNetwork",
            SchemeKind::MatchingNetwork => "EpisodicMatchingNetwork",
            SchemeKind::PartialObservationExpertsModelling => "PartialObservationExpertsModelling",
            SchemeKind::PrototypicalNetworkPoemHead => "PrototypicalNetworkPOEMHead",
            SchemeKind::MatchingNetworkPoemHead => "MatchingNetworkPOEMHead",
        }
    }

    /// Whether step methods interpret batches as support/query episodes
    pub fn is_episodic(&self) -> bool {
        matches!(
            self,
            SchemeKind::EpisodicMamlSingleLinearLayer
                | SchemeKind::EpisodicMamlFullModel
                | SchemeKind::PrototypicalNetwork
                | SchemeKind::MatchingNetwork
                | SchemeKind::PrototypicalNetworkPoemHead
                | SchemeKind::MatchingNetworkPoemHead
        )
    }
}

/// What a built scheme does, for callers that dispatch on behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub episodic: bool,
    /// Runs gradient steps on the support set (also during evaluation)
    pub inner_loop: bool,
    /// Classifies by distances in embedding space
    pub metric_based: bool,
    /// Produces precisions alongside predictions
    pub fuses_experts: bool,
    /// Optimizer tracks backbone parameters
    pub updates_backbone: bool,
}

/// Result of a training step: metrics plus gradients for the trainer to apply
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub metrics: MetricMap,
    pub gradients: Gradients,
}

/// Result of an inference step
#[derive(Debug, Clone, Default)]
pub struct Inference {
    /// Flattened backbone features `[batch, feature_dim]` per input modality
    pub features: BTreeMap<Modality, Array2<f64>>,
    /// Predictions `[batch, output_dim]` per output modality
    pub predictions: BTreeMap<Modality, Array2<f64>>,
    /// Fused precisions, only filled by expert-fusion schemes
    pub precisions: BTreeMap<Modality, Array2<f64>>,
}

/// Uniform lifecycle shared by all adaptation schemes
pub trait AdaptationScheme: Send {
    fn kind(&self) -> SchemeKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn capabilities(&self) -> Capabilities;

    fn backbone(&self) -> &SharedBackbone;

    fn is_built(&self) -> bool;

    /// Discover feature widths with a dummy pass, create heads, optimizer and
    /// scheduler. Rebuilding replaces heads and optimizer state but keeps the
    /// backbone.
    fn build(&mut self, input_shapes: &ShapeDict, output_shapes: &ShapeDict, output_activation: ActivationType)
        -> Result<()>;

    /// Reinitialise head parameters only
    fn reset_learning(&mut self) -> Result<()>;

    fn train_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<TrainOutput>;

    fn eval_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<MetricMap>;

    fn inference_step(&self, batch: &TaskBatch) -> Result<Inference>;

    /// Apply gradients returned by `train_step` (possibly accumulated)
    fn optimizer_step(&mut self, gradients: &Gradients) -> Result<()>;

    /// Advance the learning rate schedule by one epoch, returns the new rate
    fn scheduler_step(&mut self, monitored: Option<f64>) -> Result<f64>;

    fn learning_rate(&self) -> Result<f64>;

    /// Parameters the optimizer updates, fixed at build time
    fn trainable(&self) -> Result<&TrainableSet>;

    fn head_parameters(&self) -> Result<&ParamSet>;

    fn optimizer(&self) -> Result<&dyn Optimizer>;
}
