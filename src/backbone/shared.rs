//! Reference-counted backbone handle with a single fine-tuning writer

use super::Backbone;
use crate::error::{AdaptationError, Result};
use crate::nn::ParamSet;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Backbone shared by reference between schemes and the outer trainer.
///
/// Any number of schemes may read features concurrently. Writing parameters
/// requires a [`FineTuningClaim`], and only one claim can exist at a time.
#[derive(Clone)]
pub struct SharedBackbone {
    inner: Arc<RwLock<Box<dyn Backbone>>>,
    fine_tuning: Arc<AtomicBool>,
}

impl SharedBackbone {
    pub fn new<B: Backbone + 'static>(backbone: B) -> Self {
        Self::from_boxed(Box::new(backbone))
    }

    pub fn from_boxed(backbone: Box<dyn Backbone>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(backbone)),
            fine_tuning: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<dyn Backbone>> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Box<dyn Backbone>> {
        self.inner.write()
    }

    /// Snapshot of the current backbone parameters
    pub fn parameters(&self) -> ParamSet {
        self.inner.read().parameters().clone()
    }

    pub fn name(&self) -> String {
        self.inner.read().name().to_string()
    }

    /// Take exclusive fine-tuning (write) access.
    ///
    /// Fails with a configuration error when another scheme already holds it.
    pub fn claim_fine_tuning(&self) -> Result<FineTuningClaim> {
        self.fine_tuning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                AdaptationError::config(format!(
                    "backbone '{}' is already being fine-tuned by another scheme",
                    self.name()
                ))
            })?;
        Ok(FineTuningClaim {
            backbone: self.clone(),
        })
    }

    pub fn is_claimed(&self) -> bool {
        self.fine_tuning.load(Ordering::Acquire)
    }

    /// Whether both handles point at the same backbone instance
    pub fn ptr_eq(&self, other: &SharedBackbone) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedBackbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBackbone")
            .field("name", &self.name())
            .field("fine_tuning", &self.is_claimed())
            .finish()
    }
}

/// Exclusive write access to a shared backbone; released on drop
#[derive(Debug)]
pub struct FineTuningClaim {
    backbone: SharedBackbone,
}

impl FineTuningClaim {
    /// Apply `update` to the backbone's own parameters
    pub fn update<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut ParamSet) -> Result<()>,
    {
        let mut guard = self.backbone.write();
        update(guard.parameters_mut())
    }
}

impl Drop for FineTuningClaim {
    fn drop(&mut self) {
        self.backbone.fine_tuning.store(false, Ordering::Release);
    }
}
