//! Reference outer loop driving any [`crate::schemes::AdaptationScheme`]

mod trainer;

pub use trainer::{EpochSummary, Phase, Trainer, TrainerConfig};
