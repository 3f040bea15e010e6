//! Supervised fine-tuning: one head per output modality on backbone features

use super::common::{
    collect_metrics, delegate_to_core, output_dim, paired_modalities, BuildPlan, SchemeCore, StepContext,
};
use super::{AdaptationScheme, Capabilities, FineTuningConfig, Inference, SchemeKind, TrainOutput};
use crate::backbone::SharedBackbone;
use crate::data::{Batch, Modality, ShapeDict, TaskBatch};
use crate::error::{AdaptationError, Result};
use crate::heads::{HeadConfig, HeadModule};
use crate::metrics::loss::ensure_finite;
use crate::metrics::{task_loss, MetricMap, MetricSet};
use crate::nn::{ActivationType, Gradients, ModelParams, ParamSet};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Which parameters the optimizer updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FineTuneScope {
    /// Backbone frozen, only the heads learn
    HeadsOnly,
    /// Heads and backbone learn together
    FullModel,
}

impl FineTuneScope {
    pub fn updates_backbone(&self) -> bool {
        matches!(self, FineTuneScope::FullModel)
    }
}

/// Loss, predictions and (optionally) gradients of one supervised pass
pub(crate) struct SupervisedPass {
    pub loss: f64,
    pub modality_losses: BTreeMap<Modality, f64>,
    pub predictions: BTreeMap<Modality, Array2<f64>>,
    pub gradients: Option<Gradients>,
}

/// Mean task loss over all head modalities of `batch` under `params`
pub(crate) fn supervised_pass(
    ctx: &StepContext<'_>,
    params: &ModelParams,
    batch: &Batch,
    with_gradients: bool,
) -> Result<SupervisedPass> {
    let modalities: Vec<Modality> = ctx.state.output_shapes.keys().copied().collect();
    let scale = 1.0 / modalities.len().max(1) as f64;

    let mut loss = 0.0;
    let mut modality_losses = BTreeMap::new();
    let mut predictions = BTreeMap::new();
    let mut head_grads = ParamSet::new();
    let mut backbone_grads = ParamSet::new();

    for modality in modalities {
        let head = ctx.state.head(modality.as_str())?;
        let features = ctx.features(params, modality, batch)?;
        let trace = head.forward(&params.heads, &features)?;
        let target = batch.target(modality)?;
        if target.len() != features.nrows() {
            return Err(AdaptationError::config(format!(
                "'{}' has {} targets for {} inputs",
                modality,
                target.len(),
                features.nrows()
            )));
        }
        let (modality_loss, grad_output) = task_loss(&trace.output, target)?;
        ensure_finite(modality_loss, &format!("{} loss", modality))?;

        if with_gradients {
            let grad_output = grad_output * scale;
            let grad_features = head.backward(&params.heads, &trace, &grad_output, &mut head_grads)?;
            let grads = ctx.backbone_gradients(params, modality, batch, &grad_features)?;
            backbone_grads.accumulate(&grads);
        }

        loss += modality_loss * scale;
        modality_losses.insert(modality, modality_loss);
        predictions.insert(modality, trace.output);
    }

    let gradients = with_gradients.then(|| Gradients {
        heads: head_grads,
        backbone: backbone_grads,
    });
    Ok(SupervisedPass {
        loss,
        modality_losses,
        predictions,
        gradients,
    })
}

/// Predictions and flat features for every output modality of the built task
pub(crate) fn supervised_inference(ctx: &StepContext<'_>, params: &ModelParams, batch: &Batch) -> Result<Inference> {
    let mut inference = Inference::default();
    for &modality in ctx.state.output_shapes.keys() {
        let features = ctx.features(params, modality, batch)?;
        let trace = ctx.state.head(modality.as_str())?.forward(&params.heads, &features)?;
        inference.features.insert(modality, features);
        inference.predictions.insert(modality, trace.output);
    }
    Ok(inference)
}

/// One head per paired modality, sized from discovered features
pub(crate) fn build_supervised(
    core: &mut SchemeCore,
    head: &HeadConfig,
    updates_backbone: bool,
    input_shapes: &ShapeDict,
    output_shapes: &ShapeDict,
    output_activation: ActivationType,
) -> Result<()> {
    let modalities = paired_modalities(input_shapes, output_shapes)?;
    let mut rng = StdRng::seed_from_u64(core.learner.seed);
    let feature_shapes = core.discover_features(input_shapes, &modalities, &mut rng)?;

    let mut heads = Vec::with_capacity(modalities.len());
    for &modality in &modalities {
        let input_dim = feature_shapes.get(&modality).map(|d| d.iter().product()).unwrap_or(0);
        heads.push(head.build(
            modality.as_str(),
            input_dim,
            output_dim(output_shapes, modality)?,
            output_activation,
        )?);
    }

    core.install(BuildPlan {
        input_shapes: input_shapes.clone(),
        output_shapes: output_shapes.clone(),
        feature_shapes,
        heads,
        updates_backbone,
        rng,
    })
}

/// Fine-tuning with either a frozen or a trainable backbone.
///
/// A batch given as an episode is trained on its query half; fine-tuning has
/// no use for the support set.
pub struct FineTuningScheme {
    core: SchemeCore,
    scope: FineTuneScope,
    config: FineTuningConfig,
}

impl FineTuningScheme {
    pub fn new(backbone: SharedBackbone, scope: FineTuneScope, config: FineTuningConfig) -> Self {
        let kind = match scope {
            FineTuneScope::HeadsOnly => SchemeKind::SingleLinearLayerFineTuning,
            FineTuneScope::FullModel => SchemeKind::FullModelFineTuning,
        };
        Self {
            core: SchemeCore::new(kind, backbone, config.learner.clone()),
            scope,
            config,
        }
    }

    pub fn scope(&self) -> FineTuneScope {
        self.scope
    }

    pub fn config(&self) -> &FineTuningConfig {
        &self.config
    }
}

impl AdaptationScheme for FineTuningScheme {
    fn kind(&self) -> SchemeKind {
        self.core.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            episodic: false,
            inner_loop: false,
            metric_based: false,
            fuses_experts: false,
            updates_backbone: self.scope.updates_backbone(),
        }
    }

    fn build(&mut self, input_shapes: &ShapeDict, output_shapes: &ShapeDict, output_activation: ActivationType) -> Result<()> {
        self.config.validate()?;
        build_supervised(
            &mut self.core,
            &self.config.head,
            self.scope.updates_backbone(),
            input_shapes,
            output_shapes,
            output_activation,
        )
    }

    fn train_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<TrainOutput> {
        let ctx = self.core.context()?;
        let batch = batch.supervised();
        let pass = supervised_pass(&ctx, &ctx.current_params(), batch, true)?;
        let gradients = pass.gradients.unwrap_or_default();
        if !gradients.is_finite() {
            return Err(AdaptationError::unstable("non-finite gradients in fine-tuning step"));
        }
        debug!(
            scheme = self.name(),
            loss = pass.loss,
            grad_norm = gradients.global_norm(),
            "Train step"
        );
        let metrics = collect_metrics(metrics, &pass.predictions, batch, &pass.modality_losses, pass.loss)?;
        Ok(TrainOutput { metrics, gradients })
    }

    fn eval_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<MetricMap> {
        let ctx = self.core.context()?;
        let batch = batch.supervised();
        let pass = supervised_pass(&ctx, &ctx.current_params(), batch, false)?;
        collect_metrics(metrics, &pass.predictions, batch, &pass.modality_losses, pass.loss)
    }

    fn inference_step(&self, batch: &TaskBatch) -> Result<Inference> {
        let ctx = self.core.context()?;
        supervised_inference(&ctx, &ctx.current_params(), batch.supervised())
    }

    delegate_to_core!();
}
