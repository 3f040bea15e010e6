//! Optimizers and learning rate schedules owned by each scheme

mod optimizer;
mod scheduler;

pub use optimizer::{Adam, Optimizer, OptimizerConfig, Sgd};
pub use scheduler::{
    CosineAnnealingConfig, LearningRateScheduler, PlateauConfig, PlateauMode, SchedulerConfig, WarmRestartsConfig,
};
