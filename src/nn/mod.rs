//! Minimal functional neural-network toolkit
//!
//! Parameters are plain named tensors, layers are shape descriptions, and every
//! forward pass has a matching analytic backward pass.

mod activation;
mod layers;
mod params;

pub use activation::{sigmoid, softplus, ActivationType};
pub use layers::{
    avg_pool1d, avg_pool1d_backward, global_avg_pool, global_avg_pool_backward, Conv1d, Dense, Initializer,
};
pub use params::{Gradients, ModelParams, ParamSet};
