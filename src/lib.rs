//! # Adaptation Schemes
//!
//! Interchangeable ways of adapting a shared feature extractor to a task,
//! all behind one lifecycle: construct, `build` from task shapes, then train,
//! evaluate and infer.
//!
//! ## Supported Schemes
//!
//! 1. **Fine-tuning**: a single head on frozen features, or heads and backbone together
//! 2. **Episodic MAML**: inner-loop adaptation on the support set, meta-gradient from the query set
//! 3. **Prototypical Networks**: distance to class-mean prototypes in embedding space
//! 4. **Matching Networks**: attention over individual support examples
//! 5. **POEM**: per-modality experts predicting mean and precision, fused as a product of Gaussians
//!
//! Heads are sized lazily: the backbone's feature width is discovered with a
//! dummy forward pass at build time.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use adaptation_schemes::prelude::*;
//!
//! let backbone = SharedBackbone::new(IdentityBackbone::new());
//! let mut scheme = SchemeConfig::EpisodicPrototypicalNetwork(MetricConfig::default())
//!     .instantiate(backbone)?;
//! scheme.build(&input_shapes, &output_shapes, ActivationType::Linear)?;
//!
//! let mut trainer = Trainer::new(TrainerConfig::default())?;
//! trainer.fit(scheme.as_mut(), &train, &val, &MetricSet::classification())?;
//! ```
//!
//! ## Modules
//!
//! - `schemes` - The adaptation-scheme contract and its implementations
//! - `backbone` - Shared feature extractor interface and reference backbones
//! - `heads` - Linear, MLP, convolutional and residual heads
//! - `data` - Modalities, shape descriptors, batches and episodes
//! - `nn` - Parameter sets, activations and layers with analytic gradients
//! - `optim` - Optimizers and learning rate schedules
//! - `metrics` - Losses and named metric functions
//! - `training` - Reference outer training loop
//! - `config` - Experiment files and logging setup

pub mod backbone;
pub mod config;
pub mod data;
pub mod error;
pub mod heads;
pub mod metrics;
pub mod nn;
pub mod optim;
pub mod schemes;
pub mod training;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backbone::{Backbone, BackboneConfig, DenseBackbone, IdentityBackbone, SharedBackbone};

    pub use crate::config::{init_logging, load_config, ConfigError, ExperimentConfig, LoggingSettings};

    pub use crate::data::{
        dummy_batch, Batch, Episode, EpisodeSplit, Modality, ShapeDescriptor, ShapeDict, Target, TaskBatch,
    };

    pub use crate::error::{AdaptationError, Result};

    pub use crate::heads::HeadConfig;

    pub use crate::metrics::{MetricMap, MetricSet};

    pub use crate::nn::{ActivationType, Gradients, ParamSet};

    pub use crate::optim::{OptimizerConfig, SchedulerConfig};

    pub use crate::schemes::{
        fuse_experts, AdaptationScheme, Capabilities, ExpertOutput, FineTuneScope, FineTuningConfig,
        FineTuningScheme, FusedEstimate, Inference, LearnerSettings, MamlConfig, MamlScheme, MatchingNetworkScheme,
        MetricConfig, PoemConfig, PoemScheme, PrototypicalNetworkScheme, SchemeConfig, SchemeKind, TrainOutput,
    };

    pub use crate::training::{EpochSummary, Trainer, TrainerConfig};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
