//! Partial-observation experts modelling (POEM)
//!
//! Every input modality is an expert. For each output, an expert predicts a
//! mean and a precision from its own backbone features, and the experts an
//! example actually observed are combined as a product of Gaussians:
//!
//! ```text
//! Λ = Σ λ_e        μ = Σ λ_e μ_e / Λ
//! ```
//!
//! Precisions are `softplus(raw) + floor`, so they are strictly positive.
//! Class targets are trained with cross-entropy on the fused mean, dense
//! targets with the Gaussian negative log-likelihood of `(μ, Λ)`.

use super::common::{collect_metrics, delegate_to_core, output_dim, BuildPlan, SchemeCore, StepContext};
use super::{AdaptationScheme, Capabilities, Inference, PoemConfig, SchemeKind, TrainOutput};
use crate::backbone::SharedBackbone;
use crate::data::{require_shape, Batch, Modality, ShapeDict, TaskBatch, Target};
use crate::error::{AdaptationError, Instability, Result};
use crate::heads::{Head, HeadModule, HeadTrace};
use crate::metrics::loss::ensure_finite;
use crate::metrics::{cross_entropy, gaussian_nll, MetricMap, MetricSet};
use crate::nn::{sigmoid, softplus, ActivationType, Gradients, ModelParams, ParamSet};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const INSTANCE_NORM_EPS: f64 = 1e-5;

fn instability(detail: String, expert: Option<Modality>, example: Option<usize>) -> AdaptationError {
    AdaptationError::NumericalInstability(Instability {
        detail,
        expert,
        example,
        batch: None,
    })
}

/// One expert's opinion about one output
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertOutput {
    pub modality: Modality,
    /// `[batch, dim]`
    pub mean: Array2<f64>,
    /// `[batch, dim]`, strictly positive where observed
    pub precision: Array2<f64>,
    /// Whether each example observed this expert's modality
    pub observed: Vec<bool>,
}

/// Product-of-Gaussians combination of the observed experts
#[derive(Debug, Clone, PartialEq)]
pub struct FusedEstimate {
    pub mean: Array2<f64>,
    pub precision: Array2<f64>,
}

/// Precision-weighted fusion, per example and output dimension, over the
/// experts that observed the example.
///
/// Fails with a numerical instability naming the example when no expert
/// observed it, or naming expert and example for a non-positive precision.
pub fn fuse_experts(experts: &[ExpertOutput]) -> Result<FusedEstimate> {
    let first = experts
        .first()
        .ok_or_else(|| AdaptationError::config("no experts to fuse"))?;
    let dim = first.mean.dim();
    for expert in experts {
        if expert.mean.dim() != dim || expert.precision.dim() != dim || expert.observed.len() != dim.0 {
            return Err(AdaptationError::config(format!(
                "expert '{}' disagrees on shape: mean {:?}, precision {:?}, {} observations, expected {:?}",
                expert.modality,
                expert.mean.shape(),
                expert.precision.shape(),
                expert.observed.len(),
                dim
            )));
        }
    }

    let mut precision = Array2::<f64>::zeros(dim);
    let mut weighted = Array2::<f64>::zeros(dim);
    for i in 0..dim.0 {
        let mut observed_by = 0;
        for expert in experts.iter().filter(|e| e.observed[i]) {
            observed_by += 1;
            for j in 0..dim.1 {
                let lambda = expert.precision[[i, j]];
                if !(lambda.is_finite() && lambda > 0.0) {
                    return Err(instability(
                        format!("expert precision {} is not positive", lambda),
                        Some(expert.modality),
                        Some(i),
                    ));
                }
                precision[[i, j]] += lambda;
                weighted[[i, j]] += lambda * expert.mean[[i, j]];
            }
        }
        if observed_by == 0 {
            return Err(instability("no expert observed this example".to_string(), None, Some(i)));
        }
    }

    let mean = weighted / &precision;
    Ok(FusedEstimate { mean, precision })
}

/// Per-example standardisation over the feature axis, returns `(x̂, σ)`
fn instance_norm(x: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
    let mean = x
        .mean_axis(Axis(1))
        .ok_or_else(|| AdaptationError::config("cannot normalise empty features"))?;
    let centred = x - &mean.view().insert_axis(Axis(1));
    let variance = centred.mapv(|v| v * v).mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(x.nrows()));
    let scale = variance.mapv(|v| (v + INSTANCE_NORM_EPS).sqrt());
    let normalised = centred / &scale.view().insert_axis(Axis(1));
    Ok((normalised, scale))
}

/// `dx = (g - mean(g) - x̂ mean(g x̂)) / σ`, row by row
fn instance_norm_backward(normalised: &Array2<f64>, scale: &Array1<f64>, grad: &Array2<f64>) -> Array2<f64> {
    let mut out = grad.clone();
    for ((mut row, x_hat), &sigma) in out.rows_mut().into_iter().zip(normalised.rows()).zip(scale.iter()) {
        let n = row.len().max(1) as f64;
        let mean_grad = row.sum() / n;
        let mean_proj = row.iter().zip(x_hat.iter()).map(|(g, x)| g * x).sum::<f64>() / n;
        row.zip_mut_with(&x_hat, |g, &x| *g = (*g - mean_grad - x * mean_proj) / sigma);
    }
    out
}

/// Backbone features of one expert, before and after instance norm
pub(crate) struct ExpertFeatures {
    pub features: Array2<f64>,
    normalised: Array2<f64>,
    scale: Option<Array1<f64>>,
}

/// Head traces of one expert for one output
struct ExpertHeads {
    modality: Modality,
    /// `None` when the normalised features are the mean
    mean: Option<HeadTrace>,
    precision: Option<HeadTrace>,
    expert: ExpertOutput,
}

pub(crate) struct OutputPass {
    experts: Vec<ExpertHeads>,
    pub fused: FusedEstimate,
}

/// Head gradients and `dL/dnormalised` per expert, summed over outputs
#[derive(Default)]
pub(crate) struct FusionGradients {
    pub heads: ParamSet,
    pub inputs: BTreeMap<Modality, Array2<f64>>,
}

fn mean_head_name(output: Modality, expert: Modality) -> String {
    format!("{}.{}.mean", output, expert)
}

fn precision_head_name(output: Modality, expert: Modality) -> String {
    format!("{}.{}.precision", output, expert)
}

/// Mean (and precision) heads of width `width` for every `(output, expert)`
/// pair
pub(crate) fn expert_heads(
    config: &PoemConfig,
    outputs: &[(Modality, usize)],
    feature_shapes: &BTreeMap<Modality, Vec<usize>>,
    output_activation: ActivationType,
) -> Result<Vec<Head>> {
    let mut heads = Vec::new();
    for &(output, width) in outputs {
        for (&expert, dims) in feature_shapes {
            let input_dim = dims.iter().product();
            if config.use_mean_head {
                heads.push(config.mean_head.build(
                    mean_head_name(output, expert),
                    input_dim,
                    width,
                    output_activation,
                )?);
            } else if input_dim != width {
                return Err(AdaptationError::config(format!(
                    "without a mean head '{}' features ({}) must match the '{}' width {}",
                    expert, input_dim, output, width
                )));
            }
            if config.use_precision_head {
                heads.push(config.precision_head.build(
                    precision_head_name(output, expert),
                    input_dim,
                    width,
                    ActivationType::Linear,
                )?);
            }
        }
    }
    Ok(heads)
}

/// Features of every expert whose modality the batch carries
pub(crate) fn expert_features(
    config: &PoemConfig,
    ctx: &StepContext<'_>,
    params: &ModelParams,
    batch: &Batch,
) -> Result<BTreeMap<Modality, ExpertFeatures>> {
    let mut experts = BTreeMap::new();
    for &modality in ctx.state.feature_shapes.keys() {
        if !batch.inputs.contains_key(&modality) {
            continue;
        }
        let features = ctx.features(params, modality, batch)?;
        let (normalised, scale) = if config.use_input_instance_norm {
            let (normalised, scale) = instance_norm(&features)?;
            (normalised, Some(scale))
        } else {
            (features.clone(), None)
        };
        experts.insert(
            modality,
            ExpertFeatures {
                features,
                normalised,
                scale,
            },
        );
    }
    if experts.is_empty() {
        return Err(instability(
            "batch carries none of the expert modalities".to_string(),
            None,
            None,
        ));
    }
    Ok(experts)
}

/// Every expert's mean and precision for `output`, then their fusion
pub(crate) fn output_pass(
    config: &PoemConfig,
    ctx: &StepContext<'_>,
    params: &ModelParams,
    output: Modality,
    experts: &BTreeMap<Modality, ExpertFeatures>,
    batch: &Batch,
) -> Result<OutputPass> {
    let mut heads = Vec::with_capacity(experts.len());
    for (&modality, input) in experts {
        let (mean_trace, mean) = if config.use_mean_head {
            let trace = ctx
                .state
                .head(&mean_head_name(output, modality))?
                .forward(&params.heads, &input.normalised)?;
            let mean = trace.output.clone();
            (Some(trace), mean)
        } else {
            (None, input.normalised.clone())
        };
        let (precision_trace, precision) = if config.use_precision_head {
            let trace = ctx
                .state
                .head(&precision_head_name(output, modality))?
                .forward(&params.heads, &input.normalised)?;
            let floor = config.precision_floor;
            let precision = trace.output.mapv(|raw| softplus(raw) + floor);
            (Some(trace), precision)
        } else {
            (None, Array2::ones(mean.raw_dim()))
        };
        let observed = (0..input.features.nrows()).map(|i| batch.is_observed(modality, i)).collect();
        heads.push(ExpertHeads {
            modality,
            expert: ExpertOutput {
                modality,
                mean,
                precision,
                observed,
            },
            mean: mean_trace,
            precision: precision_trace,
        });
    }

    let outputs: Vec<ExpertOutput> = heads.iter().map(|h| h.expert.clone()).collect();
    let fused = fuse_experts(&outputs)?;
    Ok(OutputPass { experts: heads, fused })
}

/// Push `dL/dμ` and `dL/dΛ` of the fused estimate into each expert's heads
pub(crate) fn backward_output(
    ctx: &StepContext<'_>,
    params: &ModelParams,
    output: Modality,
    pass: &OutputPass,
    (grad_mean, grad_precision): (&Array2<f64>, &Array2<f64>),
    grads: &mut FusionGradients,
) -> Result<()> {
    let fused = &pass.fused;
    for expert in &pass.experts {
        let mut grad_expert_mean = Array2::zeros(fused.mean.raw_dim());
        let mut grad_expert_precision = Array2::zeros(fused.mean.raw_dim());
        for ((i, j), &total) in fused.precision.indexed_iter() {
            if !expert.expert.observed[i] {
                continue;
            }
            let lambda = expert.expert.precision[[i, j]];
            let mu = expert.expert.mean[[i, j]];
            grad_expert_mean[[i, j]] = grad_mean[[i, j]] * lambda / total;
            grad_expert_precision[[i, j]] =
                grad_mean[[i, j]] * (mu - fused.mean[[i, j]]) / total + grad_precision[[i, j]];
        }

        let mut grad_input = match &expert.mean {
            Some(trace) => {
                let mean_head = ctx.state.head(&mean_head_name(output, expert.modality))?;
                mean_head.backward(&params.heads, trace, &grad_expert_mean, &mut grads.heads)?
            }
            None => grad_expert_mean,
        };

        if let Some(trace) = &expert.precision {
            // λ = softplus(raw) + floor
            let mut grad_raw = grad_expert_precision;
            grad_raw.zip_mut_with(&trace.output, |g, &raw| *g *= sigmoid(raw));
            let precision_head = ctx.state.head(&precision_head_name(output, expert.modality))?;
            grad_input = grad_input + precision_head.backward(&params.heads, trace, &grad_raw, &mut grads.heads)?;
        }

        match grads.inputs.get_mut(&expert.modality) {
            Some(total) => *total += &grad_input,
            None => {
                grads.inputs.insert(expert.modality, grad_input);
            }
        }
    }
    Ok(())
}

/// Backbone gradients for the per-expert `dL/dnormalised` collected by
/// [`backward_output`]
pub(crate) fn expert_backbone_gradients(
    ctx: &StepContext<'_>,
    params: &ModelParams,
    batch: &Batch,
    experts: &BTreeMap<Modality, ExpertFeatures>,
    inputs: BTreeMap<Modality, Array2<f64>>,
) -> Result<ParamSet> {
    let mut backbone_grads = ParamSet::new();
    for (modality, grad) in inputs {
        let input = match experts.get(&modality) {
            Some(input) => input,
            None => continue,
        };
        let grad_features = match &input.scale {
            Some(scale) => instance_norm_backward(&input.normalised, scale, &grad),
            None => grad,
        };
        backbone_grads.accumulate(&ctx.backbone_gradients(params, modality, batch, &grad_features)?);
    }
    Ok(backbone_grads)
}

/// Mean and precision heads per (output, expert) pair over a shared backbone
pub struct PoemScheme {
    core: SchemeCore,
    config: PoemConfig,
}

impl PoemScheme {
    pub fn new(backbone: SharedBackbone, config: PoemConfig) -> Self {
        Self {
            core: SchemeCore::new(SchemeKind::PartialObservationExpertsModelling, backbone, config.learner.clone()),
            config,
        }
    }

    pub fn config(&self) -> &PoemConfig {
        &self.config
    }

    /// Loss of one output with `dL/dμ` and `dL/dΛ`
    fn output_loss(fused: &FusedEstimate, target: &Target) -> Result<(f64, Array2<f64>, Array2<f64>)> {
        match target {
            Target::Classes(labels) => {
                let (loss, grad_mean) = cross_entropy(&fused.mean, labels)?;
                Ok((loss, grad_mean, Array2::zeros(fused.precision.raw_dim())))
            }
            Target::Dense(values) => {
                let (loss, grads) = gaussian_nll(&fused.mean, &fused.precision, values)?;
                Ok((loss, grads.mean, grads.precision))
            }
        }
    }

    fn step(&self, batch: &Batch, metrics: &MetricSet, with_gradients: bool) -> Result<(MetricMap, Gradients)> {
        let ctx = self.core.context()?;
        let params = ctx.current_params();
        let experts = expert_features(&self.config, &ctx, &params, batch)?;
        let outputs: Vec<Modality> = ctx.state.output_shapes.keys().copied().collect();
        let scale = 1.0 / outputs.len().max(1) as f64;

        let mut loss = 0.0;
        let mut output_losses = BTreeMap::new();
        let mut predictions = BTreeMap::new();
        let mut grads = FusionGradients::default();

        for output in outputs {
            let pass = output_pass(&self.config, &ctx, &params, output, &experts, batch)?;
            let (output_loss, grad_mean, grad_precision) = Self::output_loss(&pass.fused, batch.target(output)?)?;
            ensure_finite(output_loss, &format!("{} fused loss", output))?;

            if with_gradients {
                backward_output(
                    &ctx,
                    &params,
                    output,
                    &pass,
                    (&(grad_mean * scale), &(grad_precision * scale)),
                    &mut grads,
                )?;
            }
            loss += output_loss * scale;
            output_losses.insert(output, output_loss);
            predictions.insert(output, pass.fused.mean);
        }

        let backbone = expert_backbone_gradients(&ctx, &params, batch, &experts, grads.inputs)?;
        let gradients = Gradients {
            heads: grads.heads,
            backbone,
        };
        if !gradients.is_finite() {
            return Err(AdaptationError::unstable("non-finite gradients in expert fusion"));
        }
        let out = collect_metrics(metrics, &predictions, batch, &output_losses, loss)?;
        Ok((out, gradients))
    }
}

impl AdaptationScheme for PoemScheme {
    fn kind(&self) -> SchemeKind {
        self.core.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            episodic: false,
            inner_loop: false,
            metric_based: false,
            fuses_experts: true,
            updates_backbone: self.config.fine_tune_all_layers,
        }
    }

    /// One expert per input modality; one mean (and precision) head per
    /// expert and output
    fn build(&mut self, input_shapes: &ShapeDict, output_shapes: &ShapeDict, output_activation: ActivationType) -> Result<()> {
        self.config.validate()?;
        if input_shapes.is_empty() {
            return Err(AdaptationError::config("input shape dict is empty"));
        }
        if output_shapes.is_empty() {
            return Err(AdaptationError::config("output shape dict is empty"));
        }
        let mut outputs = Vec::with_capacity(output_shapes.len());
        for &output in output_shapes.keys() {
            require_shape(output_shapes, output, "output")?;
            outputs.push((output, output_dim(output_shapes, output)?));
        }
        let experts: BTreeSet<Modality> = input_shapes.keys().copied().collect();
        let mut rng = StdRng::seed_from_u64(self.core.learner.seed);
        let feature_shapes = self.core.discover_features(input_shapes, &experts, &mut rng)?;
        let heads = expert_heads(&self.config, &outputs, &feature_shapes, output_activation)?;

        self.core.install(BuildPlan {
            input_shapes: input_shapes.clone(),
            output_shapes: output_shapes.clone(),
            feature_shapes,
            heads,
            updates_backbone: self.config.fine_tune_all_layers,
            rng,
        })
    }

    fn train_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<TrainOutput> {
        let batch = batch.supervised();
        let (metrics, gradients) = self.step(batch, metrics, true)?;
        debug!(
            scheme = self.name(),
            loss = metrics.get("loss").copied().unwrap_or(f64::NAN),
            grad_norm = gradients.global_norm(),
            "Fusion step"
        );
        Ok(TrainOutput { metrics, gradients })
    }

    fn eval_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<MetricMap> {
        Ok(self.step(batch.supervised(), metrics, false)?.0)
    }

    fn inference_step(&self, batch: &TaskBatch) -> Result<Inference> {
        let batch = batch.supervised();
        let ctx = self.core.context()?;
        let params = ctx.current_params();
        let experts = expert_features(&self.config, &ctx, &params, batch)?;

        let mut inference = Inference::default();
        for &output in ctx.state.output_shapes.keys() {
            let pass = output_pass(&self.config, &ctx, &params, output, &experts, batch)?;
            inference.predictions.insert(output, pass.fused.mean);
            inference.precisions.insert(output, pass.fused.precision);
        }
        inference.features = experts.into_iter().map(|(m, e)| (m, e.features)).collect();
        Ok(inference)
    }

    delegate_to_core!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::IdentityBackbone;
    use crate::data::ShapeDescriptor;
    use crate::heads::HeadConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayD, IxDyn};

    fn assert_close(actual: &Array2<f64>, expected: &Array2<f64>) {
        assert_eq!(actual.dim(), expected.dim());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-12);
        }
    }

    fn expert(modality: Modality, mean: Array2<f64>, precision: Array2<f64>, observed: Vec<bool>) -> ExpertOutput {
        ExpertOutput {
            modality,
            mean,
            precision,
            observed,
        }
    }

    #[test]
    fn test_equal_precision_fusion_averages() {
        let fused = fuse_experts(&[
            expert(Modality::Image, array![[1.0, -2.0]], array![[0.5, 0.5]], vec![true]),
            expert(Modality::Audio, array![[3.0, 4.0]], array![[0.5, 0.5]], vec![true]),
        ])
        .unwrap();
        assert_close(&fused.mean, &array![[2.0, 1.0]]);
        assert_close(&fused.precision, &array![[1.0, 1.0]]);
    }

    #[test]
    fn test_unobserved_expert_is_ignored() {
        let fused = fuse_experts(&[
            expert(Modality::Image, array![[1.0], [5.0]], array![[2.0], [2.0]], vec![true, true]),
            expert(Modality::Audio, array![[9.0], [7.0]], array![[3.0], [3.0]], vec![false, true]),
        ])
        .unwrap();
        assert_abs_diff_eq!(fused.mean[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fused.precision[[0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fused.mean[[1, 0]], (2.0 * 5.0 + 3.0 * 7.0) / 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_example_without_experts_is_named() {
        let err = fuse_experts(&[expert(
            Modality::Text,
            array![[1.0], [1.0]],
            array![[1.0], [1.0]],
            vec![true, false],
        )])
        .unwrap_err();
        match err {
            AdaptationError::NumericalInstability(report) => assert_eq!(report.example, Some(1)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_positive_precision_names_expert() {
        let err = fuse_experts(&[expert(Modality::Video, array![[1.0]], array![[0.0]], vec![true])]).unwrap_err();
        match err {
            AdaptationError::NumericalInstability(report) => {
                assert_eq!(report.expert, Some(Modality::Video));
                assert_eq!(report.example, Some(0));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_instance_norm_backward() {
        let x = array![[0.3, -1.0, 2.0, 0.7], [1.5, 1.4, -0.2, 0.0]];
        let weights = array![[0.2, -0.5, 1.0, 0.3], [0.7, 0.1, -0.4, 0.9]];
        let objective = |x: &Array2<f64>| (instance_norm(x).unwrap().0 * &weights).sum();
        let (normalised, scale) = instance_norm(&x).unwrap();
        let grad = instance_norm_backward(&normalised, &scale, &weights);

        let eps = 1e-6;
        let mut up = x.clone();
        up[[0, 2]] += eps;
        let mut down = x.clone();
        down[[0, 2]] -= eps;
        assert_abs_diff_eq!(grad[[0, 2]], (objective(&up) - objective(&down)) / (2.0 * eps), epsilon = 1e-6);
    }

    fn dense_task() -> (PoemScheme, Batch) {
        let inputs = ShapeDict::from([
            (Modality::Image, ShapeDescriptor::new(vec![3])),
            (Modality::Audio, ShapeDescriptor::new(vec![4])),
        ]);
        let outputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::dense(vec![2]))]);
        let config = PoemConfig {
            mean_head: HeadConfig::Linear,
            precision_head: HeadConfig::Linear,
            ..PoemConfig::default()
        };
        let mut scheme = PoemScheme::new(SharedBackbone::new(IdentityBackbone::new()), config);
        scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();

        let batch = Batch::new()
            .with_input(
                Modality::Image,
                ArrayD::from_shape_fn(IxDyn(&[4, 3]), |i| ((i[0] * 3 + i[1]) as f64 * 0.7).sin()),
            )
            .with_input(
                Modality::Audio,
                ArrayD::from_shape_fn(IxDyn(&[4, 4]), |i| ((i[0] * 4 + i[1]) as f64 * 1.3).cos()),
            )
            .with_observed(Modality::Audio, vec![true, false, true, true])
            .with_target(
                Modality::Image,
                Target::Dense(Array2::from_shape_fn((4, 2), |(i, j)| (i as f64 - j as f64) * 0.25)),
            );
        (scheme, batch)
    }

    #[test]
    fn test_head_gradients_match_finite_difference() {
        let (mut scheme, batch) = dense_task();
        let task: TaskBatch = batch.into();
        let metrics = MetricSet::new();
        let gradients = scheme.train_step(&task, &metrics).unwrap().gradients;
        assert!(gradients.backbone.is_empty());

        let eps = 1e-6;
        for name in ["image.audio.mean.linear.weight", "image.image.precision.linear.weight"] {
            let analytic = gradients.heads.get(name).unwrap()[[1, 0]];
            let original = scheme.head_parameters().unwrap().clone();
            let mut loss_at = |delta: f64| {
                let state = scheme.core.built_mut().unwrap();
                state.head_params = original.clone();
                state.head_params.get_mut(name).unwrap()[[1, 0]] += delta;
                scheme.eval_step(&task, &metrics).unwrap()["loss"]
            };
            let numeric = (loss_at(eps) - loss_at(-eps)) / (2.0 * eps);
            assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-6);
            scheme.core.built_mut().unwrap().head_params = original;
        }
    }

    #[test]
    fn test_inference_reports_precisions() {
        let (scheme, batch) = dense_task();
        let inference = scheme.inference_step(&batch.into()).unwrap();
        assert_eq!(inference.predictions[&Modality::Image].dim(), (4, 2));
        assert!(inference.precisions[&Modality::Image].iter().all(|&p| p > 0.0));
        assert_eq!(inference.features.len(), 2);
    }

    #[test]
    fn test_missing_modality_reduces_to_single_expert() {
        let (scheme, batch) = dense_task();
        let mut image_only = batch.clone();
        image_only.inputs.remove(&Modality::Audio);
        image_only.observed.clear();
        let fused = scheme.inference_step(&image_only.into()).unwrap();

        // with the mask, example 1 never saw audio either
        let masked = scheme.inference_step(&batch.into()).unwrap();
        let single = &fused.predictions[&Modality::Image];
        let both = &masked.predictions[&Modality::Image];
        for j in 0..single.ncols() {
            assert_abs_diff_eq!(single[[1, j]], both[[1, j]], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_features_as_means_without_mean_head() {
        let outputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::dense(vec![2]))]);
        let config = PoemConfig {
            use_mean_head: false,
            precision_head: HeadConfig::Linear,
            ..PoemConfig::default()
        };
        let mut scheme = PoemScheme::new(SharedBackbone::new(IdentityBackbone::new()), config);

        // audio features are 3 wide, the output only 2
        let mixed = ShapeDict::from([
            (Modality::Image, ShapeDescriptor::new(vec![2])),
            (Modality::Audio, ShapeDescriptor::new(vec![3])),
        ]);
        assert!(matches!(
            scheme.build(&mixed, &outputs, ActivationType::Linear),
            Err(AdaptationError::Configuration(_))
        ));

        let inputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::new(vec![2]))]);
        scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();
        let names = scheme.head_parameters().unwrap().names();
        assert!(!names.is_empty());
        assert!(names.iter().all(|n| n.contains("precision")));

        let batch = Batch::new()
            .with_input(Modality::Image, array![[1.0, 3.0], [-2.0, 0.0]].into_dyn())
            .with_target(Modality::Image, Target::Dense(Array2::zeros((2, 2))));
        let task: TaskBatch = batch.into();
        let inference = scheme.inference_step(&task).unwrap();
        // one expert: the fused mean is the standardised row
        assert_abs_diff_eq!(inference.predictions[&Modality::Image][[0, 0]], -1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(inference.predictions[&Modality::Image][[1, 1]], 1.0, epsilon = 1e-4);

        let out = scheme.train_step(&task, &MetricSet::new()).unwrap();
        assert!(out.gradients.heads.contains("image.image.precision.linear.weight"));
    }

    #[test]
    fn test_build_rejects_non_positive_precision_floor() {
        let inputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::new(vec![3]))]);
        let outputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::dense(vec![2]))]);
        let config = PoemConfig {
            precision_floor: 0.0,
            ..PoemConfig::default()
        };
        let mut scheme = PoemScheme::new(SharedBackbone::new(IdentityBackbone::new()), config);
        assert!(matches!(
            scheme.build(&inputs, &outputs, ActivationType::Linear),
            Err(AdaptationError::Configuration(_))
        ));
        assert!(!scheme.is_built());
    }
}
