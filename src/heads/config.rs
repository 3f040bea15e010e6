//! Serializable head configurations

use super::{ConvHead, Head, LinearHead, MlpHead, ResNetBlockHead};
use crate::error::{AdaptationError, Result};
use crate::nn::ActivationType;
use serde::{Deserialize, Serialize};

/// MLP head: optional input average pooling, then `num_layers` dense layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpHeadConfig {
    /// Total number of dense layers, including the output layer
    pub num_layers: usize,
    pub num_hidden_filters: usize,
    /// Non-overlapping pooling window applied to the flat features (1 = off)
    pub input_avg_pool_size: usize,
    pub hidden_activation: ActivationType,
}

impl Default for MlpHeadConfig {
    fn default() -> Self {
        Self {
            num_layers: 3,
            num_hidden_filters: 512,
            input_avg_pool_size: 1,
            hidden_activation: ActivationType::ReLU,
        }
    }
}

/// Conv head: pooled features as a one-channel sequence, `num_layers`
/// conv+ReLU blocks, global average pooling, dense output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvHeadConfig {
    pub num_layers: usize,
    pub num_hidden_filters: usize,
    pub kernel_size: usize,
    pub input_avg_pool_size: usize,
}

impl Default for ConvHeadConfig {
    fn default() -> Self {
        Self {
            num_layers: 3,
            num_hidden_filters: 512,
            kernel_size: 3,
            input_avg_pool_size: 7,
        }
    }
}

/// Residual head: projection, one residual block of two dense layers, output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResNetBlockHeadConfig {
    pub num_hidden_filters: usize,
}

impl Default for ResNetBlockHeadConfig {
    fn default() -> Self {
        Self {
            num_hidden_filters: 512,
        }
    }
}

/// Which head architecture to build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeadConfig {
    Linear,
    Mlp(MlpHeadConfig),
    Conv(ConvHeadConfig),
    ResNetBlock(ResNetBlockHeadConfig),
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self::Mlp(MlpHeadConfig::default())
    }
}

impl HeadConfig {
    /// Small MLP, convenient for tests and tiny backbones
    pub fn mlp(num_layers: usize, num_hidden_filters: usize) -> Self {
        Self::Mlp(MlpHeadConfig {
            num_layers,
            num_hidden_filters,
            ..MlpHeadConfig::default()
        })
    }

    /// Check hyperparameters without building anything
    pub fn validate(&self) -> Result<()> {
        match self {
            HeadConfig::Linear => Ok(()),
            HeadConfig::Mlp(cfg) => {
                if cfg.num_layers == 0 {
                    return Err(AdaptationError::config("MLP head needs at least one layer"));
                }
                if cfg.num_layers > 1 && cfg.num_hidden_filters == 0 {
                    return Err(AdaptationError::config("MLP head hidden width must be positive"));
                }
                Ok(())
            }
            HeadConfig::Conv(cfg) => {
                if cfg.num_layers == 0 || cfg.num_hidden_filters == 0 {
                    return Err(AdaptationError::config(
                        "conv head needs at least one layer and one filter",
                    ));
                }
                if cfg.kernel_size % 2 == 0 {
                    return Err(AdaptationError::config(format!(
                        "conv head kernel size must be odd, got {}",
                        cfg.kernel_size
                    )));
                }
                Ok(())
            }
            HeadConfig::ResNetBlock(cfg) => {
                if cfg.num_hidden_filters == 0 {
                    return Err(AdaptationError::config("residual head hidden width must be positive"));
                }
                Ok(())
            }
        }
    }

    /// Build a head named `name` mapping `input_dim` flat features to `output_dim`
    pub fn build(
        &self,
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        output_activation: ActivationType,
    ) -> Result<Head> {
        self.validate()?;
        if input_dim == 0 || output_dim == 0 {
            return Err(AdaptationError::config(format!(
                "head dimensions must be positive, got {} -> {}",
                input_dim, output_dim
            )));
        }
        let name = name.into();
        let head = match self {
            HeadConfig::Linear => Head::Linear(LinearHead::new(name, input_dim, output_dim, output_activation)),
            HeadConfig::Mlp(cfg) => Head::Mlp(MlpHead::new(name, input_dim, output_dim, output_activation, cfg)),
            HeadConfig::Conv(cfg) => Head::Conv(ConvHead::new(name, input_dim, output_dim, output_activation, cfg)),
            HeadConfig::ResNetBlock(cfg) => {
                Head::ResNetBlock(ResNetBlockHead::new(name, input_dim, output_dim, output_activation, cfg))
            }
        };
        Ok(head)
    }
}
