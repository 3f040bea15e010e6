//! Error types for adaptation schemes

use crate::data::Modality;
use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, AdaptationError>;

/// Context attached to a numerical failure so the outer trainer can decide
/// whether to skip the batch or clip.
#[derive(Debug, Clone, PartialEq)]
pub struct Instability {
    /// What went wrong
    pub detail: String,
    /// Expert (modality) that produced the bad value, if known
    pub expert: Option<Modality>,
    /// Example index inside the batch, if known
    pub example: Option<usize>,
    /// Batch index, attached by the trainer
    pub batch: Option<usize>,
}

impl std::fmt::Display for Instability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.detail)?;
        if let Some(expert) = self.expert {
            write!(f, " [expert: {}]", expert)?;
        }
        if let Some(example) = self.example {
            write!(f, " [example: {}]", example)?;
        }
        if let Some(batch) = self.batch {
            write!(f, " [batch: {}]", batch)?;
        }
        Ok(())
    }
}

/// Main error type for the library
#[derive(Error, Debug)]
pub enum AdaptationError {
    /// Malformed or missing shape / hyperparameter
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A step method was called before `build`
    #[error("{scheme} has not been built; call build() first")]
    NotBuilt { scheme: &'static str },

    /// Batch tensor shape disagrees with the shape seen at build time
    #[error("Shape mismatch for {modality}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        modality: Modality,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Non-positive precision, NaN or infinite loss/gradient
    #[error("Numerical instability: {0}")]
    NumericalInstability(Instability),

    /// Backbone failed to produce features
    #[error("Backbone error: {0}")]
    Backbone(String),

    /// Internal tensor reshaping failed
    #[error("Tensor error: {0}")]
    Tensor(#[from] ndarray::ShapeError),
}

impl AdaptationError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for a numerical instability without expert/example context
    pub fn unstable(detail: impl Into<String>) -> Self {
        Self::NumericalInstability(Instability {
            detail: detail.into(),
            expert: None,
            example: None,
            batch: None,
        })
    }

    /// Whether the outer trainer may recover (e.g. by skipping the batch)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NumericalInstability(_))
    }

    /// Attach the batch index to a numerical instability report
    pub fn with_batch(self, batch: usize) -> Self {
        match self {
            Self::NumericalInstability(mut report) => {
                report.batch = Some(batch);
                Self::NumericalInstability(report)
            }
            other => other,
        }
    }
}
