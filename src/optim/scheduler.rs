//! Learning rate schedulers
//!
//! Stepped once per epoch by the trainer. `ReduceLROnPlateau` needs the
//! monitored metric, the others ignore it.

use crate::error::{AdaptationError, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CosineAnnealingConfig {
    /// Epochs to go from the base rate down to `eta_min`
    pub t_max: usize,
    pub eta_min: f64,
}

impl Default for CosineAnnealingConfig {
    fn default() -> Self {
        Self {
            t_max: 100,
            eta_min: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmRestartsConfig {
    /// Length of the first cycle
    pub t_0: usize,
    /// Cycle length multiplier after each restart
    pub t_mult: usize,
    pub eta_min: f64,
}

impl Default for WarmRestartsConfig {
    fn default() -> Self {
        Self {
            t_0: 10,
            t_mult: 2,
            eta_min: 1e-6,
        }
    }
}

/// Whether a lower or a higher monitored value is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateauMode {
    #[default]
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    pub mode: PlateauMode,
    pub factor: f64,
    /// Epochs without improvement tolerated before reducing
    pub patience: usize,
    /// Relative improvement required to count as better
    pub threshold: f64,
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            mode: PlateauMode::Min,
            factor: 0.5,
            patience: 10,
            threshold: 1e-4,
            min_lr: 1e-6,
        }
    }
}

/// Named scheduler kind with hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedulerConfig {
    #[serde(rename = "CosineAnnealingLR")]
    CosineAnnealing(CosineAnnealingConfig),
    #[serde(rename = "CosineAnnealingLRWarmRestarts")]
    CosineAnnealingWarmRestarts(WarmRestartsConfig),
    #[serde(rename = "ReduceLROnPlateau")]
    ReduceLrOnPlateau(PlateauConfig),
    Constant,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::CosineAnnealing(CosineAnnealingConfig::default())
    }
}

impl SchedulerConfig {
    pub fn cosine(t_max: usize, eta_min: f64) -> Self {
        Self::CosineAnnealing(CosineAnnealingConfig { t_max, eta_min })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::CosineAnnealing(cfg) => {
                if cfg.t_max == 0 {
                    return Err(AdaptationError::config("cosine schedule t_max must be positive"));
                }
                check_floor(cfg.eta_min)
            }
            Self::CosineAnnealingWarmRestarts(cfg) => {
                if cfg.t_0 == 0 || cfg.t_mult == 0 {
                    return Err(AdaptationError::config("warm restart t_0 and t_mult must be positive"));
                }
                check_floor(cfg.eta_min)
            }
            Self::ReduceLrOnPlateau(cfg) => {
                if !(cfg.factor > 0.0 && cfg.factor < 1.0) {
                    return Err(AdaptationError::config(format!(
                        "plateau factor must be in (0, 1), got {}",
                        cfg.factor
                    )));
                }
                check_floor(cfg.min_lr)
            }
            Self::Constant => Ok(()),
        }
    }

    /// Scheduler starting at `base_lr`
    pub fn build(&self, base_lr: f64) -> Result<LearningRateScheduler> {
        self.validate()?;
        let t_i = match self {
            Self::CosineAnnealingWarmRestarts(cfg) => cfg.t_0,
            _ => 0,
        };
        Ok(LearningRateScheduler {
            config: self.clone(),
            base_lr,
            current_lr: base_lr,
            epoch: 0,
            t_cur: 0,
            t_i,
            best: None,
            bad_epochs: 0,
        })
    }
}

fn check_floor(floor: f64) -> Result<()> {
    if floor < 0.0 || !floor.is_finite() {
        return Err(AdaptationError::config(format!(
            "minimum learning rate must be non-negative, got {}",
            floor
        )));
    }
    Ok(())
}

fn cosine(base_lr: f64, eta_min: f64, t: usize, period: usize) -> f64 {
    let progress = t as f64 / period.max(1) as f64;
    eta_min + 0.5 * (base_lr - eta_min) * (1.0 + (PI * progress).cos())
}

/// Learning rate scheduler state
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    config: SchedulerConfig,
    base_lr: f64,
    current_lr: f64,
    epoch: usize,
    t_cur: usize,
    t_i: usize,
    best: Option<f64>,
    bad_epochs: usize,
}

impl LearningRateScheduler {
    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Advance one epoch and return the new learning rate
    pub fn step(&mut self, monitored: Option<f64>) -> Result<f64> {
        self.epoch += 1;
        self.current_lr = match &self.config {
            SchedulerConfig::Constant => self.base_lr,
            SchedulerConfig::CosineAnnealing(cfg) => {
                cosine(self.base_lr, cfg.eta_min, self.epoch.min(cfg.t_max), cfg.t_max)
            }
            SchedulerConfig::CosineAnnealingWarmRestarts(cfg) => {
                self.t_cur += 1;
                if self.t_cur >= self.t_i {
                    self.t_cur -= self.t_i;
                    self.t_i *= cfg.t_mult;
                }
                cosine(self.base_lr, cfg.eta_min, self.t_cur, self.t_i)
            }
            SchedulerConfig::ReduceLrOnPlateau(cfg) => {
                let value = monitored.ok_or_else(|| {
                    AdaptationError::config("ReduceLROnPlateau needs a monitored metric every epoch")
                })?;
                let improved = match self.best {
                    None => true,
                    Some(best) => match cfg.mode {
                        PlateauMode::Min => value < best * (1.0 - cfg.threshold),
                        PlateauMode::Max => value > best * (1.0 + cfg.threshold),
                    },
                };
                if improved {
                    self.best = Some(value);
                    self.bad_epochs = 0;
                    self.current_lr
                } else {
                    self.bad_epochs += 1;
                    if self.bad_epochs > cfg.patience {
                        self.bad_epochs = 0;
                        (self.current_lr * cfg.factor).max(cfg.min_lr)
                    } else {
                        self.current_lr
                    }
                }
            }
        };
        Ok(self.current_lr)
    }
}
