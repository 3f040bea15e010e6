//! Lifecycle, build bookkeeping and helpers shared by every scheme

use super::{LearnerSettings, SchemeKind};
use crate::backbone::{Backbone, FineTuningClaim, SharedBackbone};
use crate::data::{dummy_tensor, require_shape, Batch, Modality, ShapeDict};
use crate::error::{AdaptationError, Result};
use crate::heads::{Head, HeadModule};
use crate::metrics::{prefixed, MetricMap, MetricSet};
use crate::nn::{Gradients, ModelParams, ParamSet};
use crate::optim::{LearningRateScheduler, Optimizer};
use ndarray::{Array2, ArrayD, IxDyn};
use parking_lot::RwLockReadGuard;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Batch size of the dummy pass used for feature discovery
const DISCOVERY_BATCH_SIZE: usize = 2;

/// Parameter names the optimizer updates, computed once at build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainableSet {
    pub heads: BTreeSet<String>,
    pub backbone: BTreeSet<String>,
}

impl TrainableSet {
    pub fn len(&self) -> usize {
        self.heads.len() + self.backbone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn includes_backbone(&self) -> bool {
        !self.backbone.is_empty()
    }
}

/// Everything that exists only after `build`
pub(crate) struct BuiltState {
    pub input_shapes: ShapeDict,
    pub output_shapes: ShapeDict,
    /// Per-example backbone feature dims for each input modality
    pub feature_shapes: BTreeMap<Modality, Vec<usize>>,
    pub heads: BTreeMap<String, Head>,
    pub head_params: ParamSet,
    pub trainable: TrainableSet,
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: LearningRateScheduler,
    pub claim: Option<FineTuningClaim>,
    pub rng: StdRng,
}

impl BuiltState {
    pub fn feature_dim(&self, modality: Modality) -> Result<usize> {
        self.feature_shapes
            .get(&modality)
            .map(|dims| dims.iter().product())
            .ok_or_else(|| AdaptationError::config(format!("no features discovered for '{}'", modality)))
    }

    pub fn head(&self, name: &str) -> Result<&Head> {
        self.heads
            .get(name)
            .ok_or_else(|| AdaptationError::config(format!("no head named '{}'", name)))
    }

    pub fn differentiates_backbone(&self) -> bool {
        self.trainable.includes_backbone()
    }
}

pub(crate) enum Lifecycle {
    Unbuilt,
    Built(Box<BuiltState>),
}

/// What a scheme's `build` hands over to [`SchemeCore::install`]
pub(crate) struct BuildPlan {
    pub input_shapes: ShapeDict,
    pub output_shapes: ShapeDict,
    pub feature_shapes: BTreeMap<Modality, Vec<usize>>,
    pub heads: Vec<Head>,
    pub updates_backbone: bool,
    pub rng: StdRng,
}

/// State and bookkeeping common to all schemes
pub(crate) struct SchemeCore {
    pub kind: SchemeKind,
    pub backbone: SharedBackbone,
    pub learner: LearnerSettings,
    pub state: Lifecycle,
}

impl SchemeCore {
    pub fn new(kind: SchemeKind, backbone: SharedBackbone, learner: LearnerSettings) -> Self {
        Self {
            kind,
            backbone,
            learner,
            state: Lifecycle::Unbuilt,
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state, Lifecycle::Built(_))
    }

    pub fn built(&self) -> Result<&BuiltState> {
        match &self.state {
            Lifecycle::Built(state) => Ok(state),
            Lifecycle::Unbuilt => Err(AdaptationError::NotBuilt {
                scheme: self.kind.name(),
            }),
        }
    }

    pub fn built_mut(&mut self) -> Result<&mut BuiltState> {
        match &mut self.state {
            Lifecycle::Built(state) => Ok(state),
            Lifecycle::Unbuilt => Err(AdaptationError::NotBuilt {
                scheme: self.kind.name(),
            }),
        }
    }

    /// Read access to the backbone for the duration of one step
    pub fn context(&self) -> Result<StepContext<'_>> {
        let state = self.built()?;
        Ok(StepContext {
            state,
            backbone: self.backbone.read(),
        })
    }

    /// Run one dummy forward pass per modality and record the feature dims
    pub fn discover_features(
        &self,
        input_shapes: &ShapeDict,
        modalities: &BTreeSet<Modality>,
        rng: &mut StdRng,
    ) -> Result<BTreeMap<Modality, Vec<usize>>> {
        let backbone = self.backbone.read();
        let mut feature_shapes = BTreeMap::new();
        for &modality in modalities {
            let shape = require_shape(input_shapes, modality, "input")?;
            if !backbone.supports(modality) {
                return Err(AdaptationError::config(format!(
                    "backbone '{}' cannot embed the '{}' modality",
                    backbone.name(),
                    modality
                )));
            }
            let dummy = dummy_tensor(shape, DISCOVERY_BATCH_SIZE, rng);
            let features = backbone.forward(backbone.parameters(), modality, &dummy)?;
            let dims = features.shape().get(1..).map(<[usize]>::to_vec).unwrap_or_default();
            if dims.is_empty() || dims.iter().product::<usize>() == 0 {
                return Err(AdaptationError::Backbone(format!(
                    "backbone '{}' produced empty features for '{}': {:?}",
                    backbone.name(),
                    modality,
                    features.shape()
                )));
            }
            debug!(modality = %modality, feature_dims = ?dims, "Discovered backbone features");
            feature_shapes.insert(modality, dims);
        }
        Ok(feature_shapes)
    }

    /// Initialise heads, pick the trainable set, claim the backbone if needed
    /// and create optimizer and scheduler. On failure a previously built state
    /// stays in place.
    pub fn install(&mut self, plan: BuildPlan) -> Result<()> {
        let BuildPlan {
            input_shapes,
            output_shapes,
            feature_shapes,
            heads,
            updates_backbone,
            mut rng,
        } = plan;

        let mut head_params = ParamSet::new();
        let mut head_map = BTreeMap::new();
        for head in heads {
            head.init_params(&mut head_params, &mut rng)?;
            head_map.insert(head.name().to_string(), head);
        }

        let trainable = TrainableSet {
            heads: head_params.names(),
            backbone: if updates_backbone {
                self.backbone.parameters().names()
            } else {
                BTreeSet::new()
            },
        };

        let optimizer = self.learner.optimizer.build()?;
        let scheduler = self.learner.scheduler.build(self.learner.optimizer.lr())?;

        // a rebuild keeps the claim this scheme already holds
        let held = match &mut self.state {
            Lifecycle::Built(state) if updates_backbone => state.claim.take(),
            _ => None,
        };
        let claim = match held {
            Some(claim) => Some(claim),
            None if updates_backbone => Some(self.backbone.claim_fine_tuning()?),
            None => None,
        };

        info!(
            scheme = self.kind.name(),
            heads = head_map.len(),
            head_params = head_params.num_elements(),
            trainable_tensors = trainable.len(),
            fine_tunes_backbone = updates_backbone,
            "Built adaptation scheme"
        );

        self.state = Lifecycle::Built(Box::new(BuiltState {
            input_shapes,
            output_shapes,
            feature_shapes,
            heads: head_map,
            head_params,
            trainable,
            optimizer,
            scheduler,
            claim,
            rng,
        }));
        Ok(())
    }

    pub fn reset_learning(&mut self) -> Result<()> {
        let kind = self.kind;
        let state = self.built_mut()?;
        let mut fresh = ParamSet::new();
        for head in state.heads.values() {
            head.init_params(&mut fresh, &mut state.rng)?;
        }
        state.head_params = fresh;
        info!(scheme = kind.name(), "Reset head parameters");
        Ok(())
    }

    pub fn optimizer_step(&mut self, gradients: &Gradients) -> Result<()> {
        if !gradients.is_finite() {
            return Err(AdaptationError::unstable("refusing to apply non-finite gradients"));
        }
        let state = self.built_mut()?;
        let updated_heads = state
            .optimizer
            .step("heads", &mut state.head_params, &gradients.heads, &state.trainable.heads)?;

        let mut updated_backbone = 0;
        if let Some(claim) = state.claim.as_ref() {
            if !gradients.backbone.is_empty() {
                let optimizer = &mut state.optimizer;
                let tracked = &state.trainable.backbone;
                claim.update(|params| {
                    updated_backbone = optimizer.step("backbone", params, &gradients.backbone, tracked)?;
                    Ok(())
                })?;
            }
        }
        debug!(updated_heads, updated_backbone, "Applied optimizer step");
        Ok(())
    }

    pub fn scheduler_step(&mut self, monitored: Option<f64>) -> Result<f64> {
        let state = self.built_mut()?;
        let lr = state.scheduler.step(monitored)?;
        state.optimizer.set_learning_rate(lr);
        debug!(lr, epoch = state.scheduler.epoch(), "Stepped learning rate schedule");
        Ok(lr)
    }

    pub fn learning_rate(&self) -> Result<f64> {
        Ok(self.built()?.optimizer.learning_rate())
    }
}

/// Modalities present in both shape dicts. Every output key must have an input.
pub(crate) fn paired_modalities(input_shapes: &ShapeDict, output_shapes: &ShapeDict) -> Result<BTreeSet<Modality>> {
    if output_shapes.is_empty() {
        return Err(AdaptationError::config("output shape dict is empty"));
    }
    let mut paired = BTreeSet::new();
    for &modality in output_shapes.keys() {
        require_shape(input_shapes, modality, "input")?;
        require_shape(output_shapes, modality, "output")?;
        paired.insert(modality);
    }
    Ok(paired)
}

/// `[batch, d1, d2, ...] -> [batch, d1 * d2 * ...]`
pub(crate) fn flatten_batch(tensor: &ArrayD<f64>) -> Result<Array2<f64>> {
    let batch_size = tensor.shape().first().copied().unwrap_or(0);
    let width = tensor.shape().iter().skip(1).product::<usize>();
    Ok(tensor.as_standard_layout().into_owned().into_shape((batch_size, width))?)
}

/// Per-step view of the built state plus a read guard on the backbone
pub(crate) struct StepContext<'a> {
    pub state: &'a BuiltState,
    pub backbone: RwLockReadGuard<'a, Box<dyn Backbone>>,
}

impl<'a> StepContext<'a> {
    /// Persistent parameters, backbone read in place
    pub fn current_params(&self) -> ModelParams {
        ModelParams::new(self.state.head_params.clone(), None)
    }

    /// Value copy of everything the inner loop may adapt
    pub fn working_copy(&self) -> ModelParams {
        let backbone = if self.state.differentiates_backbone() {
            Some(self.backbone.parameters().clone())
        } else {
            None
        };
        ModelParams::new(self.state.head_params.clone(), backbone)
    }

    pub fn backbone_params<'p>(&'p self, params: &'p ModelParams) -> &'p ParamSet {
        match params.backbone.as_ref() {
            Some(working) => working,
            None => self.backbone.parameters(),
        }
    }

    pub fn check_input(&self, modality: Modality, input: &ArrayD<f64>) -> Result<()> {
        let expected = &require_shape(&self.state.input_shapes, modality, "input")?.dims;
        let actual = input.shape().get(1..).unwrap_or(&[]);
        if actual != expected.as_slice() {
            return Err(AdaptationError::ShapeMismatch {
                modality,
                expected: expected.clone(),
                actual: actual.to_vec(),
            });
        }
        Ok(())
    }

    /// Flat features `[batch, feature_dim]` for one modality of `batch`
    pub fn features(&self, params: &ModelParams, modality: Modality, batch: &Batch) -> Result<Array2<f64>> {
        let input = batch.input(modality)?;
        self.check_input(modality, input)?;
        let features = self
            .backbone
            .forward(self.backbone_params(params), modality, input)?;
        flatten_batch(&features)
    }

    /// Backbone gradients for `dL/dfeatures`, empty when the backbone is frozen
    pub fn backbone_gradients(
        &self,
        params: &ModelParams,
        modality: Modality,
        batch: &Batch,
        grad_features: &Array2<f64>,
    ) -> Result<ParamSet> {
        if !self.state.differentiates_backbone() {
            return Ok(ParamSet::new());
        }
        let input = batch.input(modality)?;
        let feature_dims = self
            .state
            .feature_shapes
            .get(&modality)
            .ok_or_else(|| AdaptationError::config(format!("no features discovered for '{}'", modality)))?;
        let mut dims = vec![grad_features.nrows()];
        dims.extend(feature_dims);
        let grad = grad_features.as_standard_layout().into_owned().into_shape(IxDyn(&dims))?;
        let grads = self
            .backbone
            .backward(self.backbone_params(params), modality, input, &grad)?;
        Ok(grads.filtered(&self.state.trainable.backbone))
    }
}

/// Metric map for one step: un-prefixed for a single modality, prefixed with
/// the modality name otherwise. `"loss"` is always the scheme's loss.
pub(crate) fn collect_metrics(
    metrics: &MetricSet,
    predictions: &BTreeMap<Modality, Array2<f64>>,
    batch: &Batch,
    modality_losses: &BTreeMap<Modality, f64>,
    loss: f64,
) -> Result<MetricMap> {
    let mut out = MetricMap::new();
    let single = predictions.len() == 1;
    for (&modality, prediction) in predictions {
        let target = batch.target(modality)?;
        let values = metrics.compute(prediction, target);
        if single {
            out.extend(values);
        } else {
            out.extend(prefixed(&values, modality.as_str()));
            if let Some(&l) = modality_losses.get(&modality) {
                out.insert(format!("{}_loss", modality), l);
            }
        }
    }
    out.insert("loss".to_string(), loss);
    Ok(out)
}

/// Delegates the lifecycle bookkeeping methods of [`super::AdaptationScheme`]
/// to a `core: SchemeCore` field
macro_rules! delegate_to_core {
    () => {
        fn backbone(&self) -> &crate::backbone::SharedBackbone {
            &self.core.backbone
        }

        fn is_built(&self) -> bool {
            self.core.is_built()
        }

        fn reset_learning(&mut self) -> crate::error::Result<()> {
            self.core.reset_learning()
        }

        fn optimizer_step(&mut self, gradients: &crate::nn::Gradients) -> crate::error::Result<()> {
            self.core.optimizer_step(gradients)
        }

        fn scheduler_step(&mut self, monitored: Option<f64>) -> crate::error::Result<f64> {
            self.core.scheduler_step(monitored)
        }

        fn learning_rate(&self) -> crate::error::Result<f64> {
            self.core.learning_rate()
        }

        fn trainable(&self) -> crate::error::Result<&crate::schemes::TrainableSet> {
            Ok(&self.core.built()?.trainable)
        }

        fn head_parameters(&self) -> crate::error::Result<&crate::nn::ParamSet> {
            Ok(&self.core.built()?.head_params)
        }

        fn optimizer(&self) -> crate::error::Result<&dyn crate::optim::Optimizer> {
            Ok(self.core.built()?.optimizer.as_ref())
        }
    };
}

pub(crate) use delegate_to_core;

/// Output width for an output shape descriptor
pub(crate) fn output_dim(output_shapes: &ShapeDict, modality: Modality) -> Result<usize> {
    Ok(require_shape(output_shapes, modality, "output")?.num_elements())
}
