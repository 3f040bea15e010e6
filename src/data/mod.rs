//! Data contracts shared with the task and data collaborators
//!
//! - `Modality` names the input streams a backbone can embed
//! - `ShapeDict` describes per-modality shapes at build time
//! - `Batch` / `TaskBatch` / `Episode` carry inputs and targets into step methods

mod batch;
mod episode;
mod modality;
mod shapes;

pub use batch::{Batch, Target};
pub use episode::{Episode, EpisodeSplit, TaskBatch};
pub use modality::Modality;
pub use shapes::{dummy_batch, dummy_tensor, require_shape, DType, ShapeDescriptor, ShapeDict};
