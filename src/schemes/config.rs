//! Scheme configuration and the named scheme registry

use super::{
    AdaptationScheme, DistanceMetric, FineTuneScope, FineTuningScheme, MamlScheme, MatchingNetworkScheme,
    PoemHeadMetricScheme, PoemScheme, PrototypicalNetworkScheme, SchemeKind,
};
use crate::backbone::SharedBackbone;
use crate::data::EpisodeSplit;
use crate::error::{AdaptationError, Result};
use crate::heads::{ConvHeadConfig, HeadConfig, MlpHeadConfig, ResNetBlockHeadConfig};
use crate::optim::{OptimizerConfig, SchedulerConfig};
use serde::{Deserialize, Deserializer, Serialize};

/// Hyperparameters every scheme carries: optimizer, schedule and init seed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerSettings {
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    /// Seed for dummy inputs and head initialisation
    pub seed: u64,
}

impl Default for LearnerSettings {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            seed: 42,
        }
    }
}

impl LearnerSettings {
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        self.scheduler.validate()
    }

    /// Builder pattern: set optimizer
    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Builder pattern: set scheduler
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Builder pattern: set seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Fine-tuning: one head per output modality on top of the backbone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuningConfig {
    pub learner: LearnerSettings,
    pub head: HeadConfig,
}

impl Default for FineTuningConfig {
    fn default() -> Self {
        Self {
            learner: LearnerSettings::default(),
            head: HeadConfig::Linear,
        }
    }
}

impl FineTuningConfig {
    pub fn validate(&self) -> Result<()> {
        self.learner.validate()?;
        self.head.validate()
    }
}

/// MAML inner/outer loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MamlConfig {
    pub learner: LearnerSettings,
    pub head: HeadConfig,
    pub num_inner_steps: usize,
    pub inner_lr: f64,
    /// Differentiate through the inner loop instead of the first-order shortcut
    pub second_order: bool,
    /// Step size for finite-difference Hessian-vector products
    pub finite_difference_eps: f64,
    pub episode_split: EpisodeSplit,
}

impl Default for MamlConfig {
    fn default() -> Self {
        Self {
            learner: LearnerSettings::default(),
            head: HeadConfig::Linear,
            num_inner_steps: 5,
            inner_lr: 0.01,
            second_order: false,
            finite_difference_eps: 1e-4,
            episode_split: EpisodeSplit::Halves,
        }
    }
}

impl MamlConfig {
    pub fn validate(&self) -> Result<()> {
        self.learner.validate()?;
        self.head.validate()?;
        if !(self.inner_lr.is_finite() && self.inner_lr > 0.0) {
            return Err(AdaptationError::config(format!(
                "inner learning rate must be positive, got {}",
                self.inner_lr
            )));
        }
        if self.second_order && !(self.finite_difference_eps > 0.0) {
            return Err(AdaptationError::config("finite difference step must be positive"));
        }
        Ok(())
    }
}

/// Prototypical and matching networks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub learner: LearnerSettings,
    pub distance: DistanceMetric,
    /// Scores and attention logits are `-distance / temperature`
    pub temperature: f64,
    /// Optional head applied to flat features before measuring distances
    pub embedding_head: Option<HeadConfig>,
    pub embedding_dim: usize,
    pub fine_tune_backbone: bool,
    /// Let gradients flow through the support-set embeddings
    pub differentiate_support: bool,
    pub episode_split: EpisodeSplit,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            learner: LearnerSettings::default(),
            distance: DistanceMetric::SquaredEuclidean,
            temperature: 1.0,
            embedding_head: None,
            embedding_dim: 64,
            fine_tune_backbone: true,
            differentiate_support: true,
            episode_split: EpisodeSplit::Halves,
        }
    }
}

impl MetricConfig {
    pub fn validate(&self) -> Result<()> {
        self.learner.validate()?;
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(AdaptationError::config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if let Some(head) = &self.embedding_head {
            head.validate()?;
            if self.embedding_dim == 0 {
                return Err(AdaptationError::config("embedding dimension must be positive"));
            }
        }
        Ok(())
    }
}

/// Partial-observation experts modelling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoemConfig {
    pub learner: LearnerSettings,
    pub fine_tune_all_layers: bool,
    /// Standardise each example's features before the heads
    pub use_input_instance_norm: bool,
    /// Without a mean head an expert's (normalised) features are its mean and
    /// must be as wide as the output
    pub use_mean_head: bool,
    /// Without a precision head every expert gets unit precision
    pub use_precision_head: bool,
    pub mean_head: HeadConfig,
    pub precision_head: HeadConfig,
    /// Added to `softplus(raw)` so precisions stay strictly positive
    pub precision_floor: f64,
}

impl Default for PoemConfig {
    fn default() -> Self {
        Self {
            learner: LearnerSettings::default().with_optimizer(OptimizerConfig::adam(2e-5)),
            fine_tune_all_layers: true,
            use_input_instance_norm: true,
            use_mean_head: true,
            use_precision_head: true,
            mean_head: HeadConfig::default(),
            precision_head: HeadConfig::default(),
            precision_floor: 1e-6,
        }
    }
}

impl PoemConfig {
    pub fn validate(&self) -> Result<()> {
        self.learner.validate()?;
        self.mean_head.validate()?;
        self.precision_head.validate()?;
        if !(self.precision_floor.is_finite() && self.precision_floor > 0.0) {
            return Err(AdaptationError::config(format!(
                "precision floor must be positive, got {}",
                self.precision_floor
            )));
        }
        Ok(())
    }
}

/// Mean and precision heads default to `preset` unless the entry names them
fn poem_with_heads<'de, D: Deserializer<'de>>(
    deserializer: D,
    preset: HeadConfig,
) -> std::result::Result<PoemConfig, D::Error> {
    #[derive(Deserialize)]
    struct Entry {
        mean_head: Option<HeadConfig>,
        precision_head: Option<HeadConfig>,
        #[serde(flatten)]
        rest: PoemConfig,
    }
    let Entry {
        mean_head,
        precision_head,
        mut rest,
    } = Entry::deserialize(deserializer)?;
    rest.mean_head = mean_head.unwrap_or_else(|| preset.clone());
    rest.precision_head = precision_head.unwrap_or(preset);
    Ok(rest)
}

fn poem_mlp_heads<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<PoemConfig, D::Error> {
    poem_with_heads(deserializer, HeadConfig::Mlp(MlpHeadConfig::default()))
}

fn poem_conv_heads<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<PoemConfig, D::Error> {
    poem_with_heads(deserializer, HeadConfig::Conv(ConvHeadConfig::default()))
}

fn poem_resnet_heads<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<PoemConfig, D::Error> {
    poem_with_heads(deserializer, HeadConfig::ResNetBlock(ResNetBlockHeadConfig::default()))
}

fn default_temperature() -> f64 {
    1.0
}

fn default_fused_embedding_dim() -> usize {
    512
}

fn enabled() -> bool {
    true
}

/// Prototypical and matching networks classifying in the space of fused POEM
/// expert means. The expert fields sit next to the metric ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoemHeadMetricConfig {
    #[serde(flatten)]
    pub experts: PoemConfig,
    #[serde(default)]
    pub distance: DistanceMetric,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Width of the mean heads, which is the width of the fused embedding
    #[serde(default = "default_fused_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "enabled")]
    pub differentiate_support: bool,
    #[serde(default)]
    pub episode_split: EpisodeSplit,
}

impl Default for PoemHeadMetricConfig {
    fn default() -> Self {
        Self {
            experts: PoemConfig::default(),
            distance: DistanceMetric::default(),
            temperature: default_temperature(),
            embedding_dim: default_fused_embedding_dim(),
            differentiate_support: true,
            episode_split: EpisodeSplit::default(),
        }
    }
}

impl PoemHeadMetricConfig {
    pub fn validate(&self) -> Result<()> {
        self.experts.validate()?;
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(AdaptationError::config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.experts.use_mean_head && self.embedding_dim == 0 {
            return Err(AdaptationError::config("embedding dimension must be positive"));
        }
        Ok(())
    }
}

/// Named scheme registry. The `type` tag selects the learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchemeConfig {
    #[serde(alias = "EpisodicSingleLinearLayerFineTuning")]
    SingleLinearLayerFineTuning(FineTuningConfig),
    #[serde(alias = "EpisodicFullModelFineTuning")]
    FullModelFineTuning(FineTuningConfig),
    #[serde(rename = "EpisodicMAMLSingleLinearLayer")]
    EpisodicMamlSingleLinearLayer(MamlConfig),
    #[serde(rename = "EpisodicMAMLFullModel")]
    EpisodicMamlFullModel(MamlConfig),
    EpisodicPrototypicalNetwork(MetricConfig),
    EpisodicMatchingNetwork(MetricConfig),
    PartialObservationExpertsModelling(PoemConfig),
    #[serde(rename = "PartialObservationExpertsMLPHeadModelling", deserialize_with = "poem_mlp_heads")]
    PartialObservationExpertsMlpHeadModelling(PoemConfig),
    #[serde(deserialize_with = "poem_conv_heads")]
    PartialObservationExpertsConvHeadModelling(PoemConfig),
    #[serde(deserialize_with = "poem_resnet_heads")]
    PartialObservationExpertsResNetHeadModelling(PoemConfig),
    #[serde(rename = "PrototypicalNetworkPOEMHead")]
    PrototypicalNetworkPoemHead(PoemHeadMetricConfig),
    #[serde(rename = "MatchingNetworkPOEMHead")]
    MatchingNetworkPoemHead(PoemHeadMetricConfig),
}

impl Default for SchemeConfig {
    fn default() -> Self {
        Self::SingleLinearLayerFineTuning(FineTuningConfig::default())
    }
}

impl SchemeConfig {
    pub fn kind(&self) -> SchemeKind {
        match self {
            Self::SingleLinearLayerFineTuning(_) => SchemeKind::SingleLinearLayerFineTuning,
            Self::FullModelFineTuning(_) => SchemeKind::FullModelFineTuning,
            Self::EpisodicMamlSingleLinearLayer(_) => SchemeKind::EpisodicMamlSingleLinearLayer,
            Self::EpisodicMamlFullModel(_) => SchemeKind::EpisodicMamlFullModel,
            Self::EpisodicPrototypicalNetwork(_) => SchemeKind::PrototypicalNetwork,
            Self::EpisodicMatchingNetwork(_) => SchemeKind::MatchingNetwork,
            Self::PartialObservationExpertsModelling(_)
            | Self::PartialObservationExpertsMlpHeadModelling(_)
            | Self::PartialObservationExpertsConvHeadModelling(_)
            | Self::PartialObservationExpertsResNetHeadModelling(_) => SchemeKind::PartialObservationExpertsModelling,
            Self::PrototypicalNetworkPoemHead(_) => SchemeKind::PrototypicalNetworkPoemHead,
            Self::MatchingNetworkPoemHead(_) => SchemeKind::MatchingNetworkPoemHead,
        }
    }

    pub fn learner(&self) -> &LearnerSettings {
        match self {
            Self::SingleLinearLayerFineTuning(cfg) | Self::FullModelFineTuning(cfg) => &cfg.learner,
            Self::EpisodicMamlSingleLinearLayer(cfg) | Self::EpisodicMamlFullModel(cfg) => &cfg.learner,
            Self::EpisodicPrototypicalNetwork(cfg) | Self::EpisodicMatchingNetwork(cfg) => &cfg.learner,
            Self::PartialObservationExpertsModelling(cfg)
            | Self::PartialObservationExpertsMlpHeadModelling(cfg)
            | Self::PartialObservationExpertsConvHeadModelling(cfg)
            | Self::PartialObservationExpertsResNetHeadModelling(cfg) => &cfg.learner,
            Self::PrototypicalNetworkPoemHead(cfg) | Self::MatchingNetworkPoemHead(cfg) => &cfg.experts.learner,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SingleLinearLayerFineTuning(cfg) | Self::FullModelFineTuning(cfg) => cfg.validate(),
            Self::EpisodicMamlSingleLinearLayer(cfg) | Self::EpisodicMamlFullModel(cfg) => cfg.validate(),
            Self::EpisodicPrototypicalNetwork(cfg) | Self::EpisodicMatchingNetwork(cfg) => cfg.validate(),
            Self::PartialObservationExpertsModelling(cfg)
            | Self::PartialObservationExpertsMlpHeadModelling(cfg)
            | Self::PartialObservationExpertsConvHeadModelling(cfg)
            | Self::PartialObservationExpertsResNetHeadModelling(cfg) => cfg.validate(),
            Self::PrototypicalNetworkPoemHead(cfg) | Self::MatchingNetworkPoemHead(cfg) => cfg.validate(),
        }
    }

    /// Construct the (unbuilt) scheme against a shared backbone
    pub fn instantiate(&self, backbone: SharedBackbone) -> Result<Box<dyn AdaptationScheme>> {
        self.validate()?;
        let scheme: Box<dyn AdaptationScheme> = match self {
            Self::SingleLinearLayerFineTuning(cfg) => {
                Box::new(FineTuningScheme::new(backbone, FineTuneScope::HeadsOnly, cfg.clone()))
            }
            Self::FullModelFineTuning(cfg) => {
                Box::new(FineTuningScheme::new(backbone, FineTuneScope::FullModel, cfg.clone()))
            }
            Self::EpisodicMamlSingleLinearLayer(cfg) => {
                Box::new(MamlScheme::new(backbone, FineTuneScope::HeadsOnly, cfg.clone()))
            }
            Self::EpisodicMamlFullModel(cfg) => Box::new(MamlScheme::new(backbone, FineTuneScope::FullModel, cfg.clone())),
            Self::EpisodicPrototypicalNetwork(cfg) => Box::new(PrototypicalNetworkScheme::new(backbone, cfg.clone())),
            Self::EpisodicMatchingNetwork(cfg) => Box::new(MatchingNetworkScheme::new(backbone, cfg.clone())),
            Self::PartialObservationExpertsModelling(cfg)
            | Self::PartialObservationExpertsMlpHeadModelling(cfg)
            | Self::PartialObservationExpertsConvHeadModelling(cfg)
            | Self::PartialObservationExpertsResNetHeadModelling(cfg) => Box::new(PoemScheme::new(backbone, cfg.clone())),
            Self::PrototypicalNetworkPoemHead(cfg) => Box::new(PoemHeadMetricScheme::prototypical(backbone, cfg.clone())),
            Self::MatchingNetworkPoemHead(cfg) => Box::new(PoemHeadMetricScheme::matching(backbone, cfg.clone())),
        };
        Ok(scheme)
    }
}
