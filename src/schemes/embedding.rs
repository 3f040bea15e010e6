//! Embedding and episode plumbing shared by the metric-based schemes

use super::common::{collect_metrics, paired_modalities, BuildPlan, SchemeCore, StepContext};
use super::{Inference, MetricConfig};
use crate::data::{Batch, Episode, EpisodeSplit, Modality, ShapeDict, TaskBatch, Target};
use crate::error::{AdaptationError, Result};
use crate::heads::{HeadModule, HeadTrace};
use crate::metrics::loss::ensure_finite;
use crate::metrics::{MetricMap, MetricSet};
use crate::nn::{ActivationType, Gradients, ModelParams};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Result of classifying a query set against a labelled support set
pub(crate) struct EpisodeScores {
    /// Per-class scores `[query, classes]`
    pub predictions: Array2<f64>,
    pub loss: f64,
    /// `dL/dquery_embeddings`
    pub grad_query: Array2<f64>,
    /// `dL/dsupport_embeddings`
    pub grad_support: Array2<f64>,
}

/// Turns support and query embeddings into class scores
pub(crate) trait EpisodeClassifier {
    fn predict(&self, support: &Array2<f64>, labels: &[usize], query: &Array2<f64>, classes: usize)
        -> Result<Array2<f64>>;

    fn score(
        &self,
        support: &Array2<f64>,
        labels: &[usize],
        query: &Array2<f64>,
        query_labels: &[usize],
        classes: usize,
    ) -> Result<EpisodeScores>;
}

pub(crate) fn embedding_head_name(modality: Modality) -> String {
    format!("{}.embedding", modality)
}

/// Class labels of a metric-scheme target
pub(crate) fn class_labels<'a>(batch: &'a Batch, modality: Modality, classes: usize) -> Result<&'a [usize]> {
    let labels = match batch.target(modality)? {
        Target::Classes(labels) => labels.as_slice(),
        Target::Dense(_) => {
            return Err(AdaptationError::config(format!(
                "metric-based schemes need class labels for '{}'",
                modality
            )))
        }
    };
    if let Some(&bad) = labels.iter().find(|&&y| y >= classes) {
        return Err(AdaptationError::config(format!(
            "label {} out of range for {} classes",
            bad, classes
        )));
    }
    Ok(labels)
}

/// Discover features and create the optional embedding heads
pub(crate) fn build_metric(
    core: &mut SchemeCore,
    config: &MetricConfig,
    input_shapes: &ShapeDict,
    output_shapes: &ShapeDict,
) -> Result<()> {
    config.validate()?;
    let modalities = paired_modalities(input_shapes, output_shapes)?;
    for &modality in &modalities {
        if !output_shapes[&modality].is_classification() {
            return Err(AdaptationError::config(format!(
                "metric-based schemes classify; '{}' output is not a class label",
                modality
            )));
        }
    }
    let mut rng = StdRng::seed_from_u64(core.learner.seed);
    let feature_shapes = core.discover_features(input_shapes, &modalities, &mut rng)?;

    let mut heads = Vec::new();
    if let Some(head) = &config.embedding_head {
        for &modality in &modalities {
            let input_dim = feature_shapes.get(&modality).map(|d| d.iter().product()).unwrap_or(0);
            heads.push(head.build(
                embedding_head_name(modality),
                input_dim,
                config.embedding_dim,
                ActivationType::Linear,
            )?);
        }
    }

    core.install(BuildPlan {
        input_shapes: input_shapes.clone(),
        output_shapes: output_shapes.clone(),
        feature_shapes,
        heads,
        updates_backbone: config.fine_tune_backbone,
        rng,
    })
}

/// Turns one batch into embeddings for one output modality and pushes
/// `dL/dembeddings` back into heads and backbone
pub(crate) trait Embedder {
    type Pass;

    fn embed(&self, ctx: &StepContext<'_>, params: &ModelParams, output: Modality, batch: &Batch) -> Result<Self::Pass>;

    fn embeddings<'p>(&self, pass: &'p Self::Pass) -> &'p Array2<f64>;

    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        ctx: &StepContext<'_>,
        params: &ModelParams,
        output: Modality,
        batch: &Batch,
        pass: &Self::Pass,
        grad_embeddings: &Array2<f64>,
        gradients: &mut Gradients,
    ) -> Result<()>;

    /// What inference reports besides the scores
    fn into_report(&self, pass: Self::Pass) -> EmbeddingReport;
}

/// Backbone features per input modality, plus the embedding precision of
/// fused embeddings
#[derive(Default)]
pub(crate) struct EmbeddingReport {
    pub features: Vec<(Modality, Array2<f64>)>,
    pub precision: Option<Array2<f64>>,
}

/// Flat features and embeddings of one modality
pub(crate) struct EmbeddingPass {
    modality: Modality,
    features: Array2<f64>,
    embeddings: Array2<f64>,
    trace: Option<HeadTrace>,
}

/// The output modality's own backbone features, through the embedding head
/// when one was built
#[derive(Debug, Clone, Copy)]
pub(crate) struct FeatureEmbedder;

impl Embedder for FeatureEmbedder {
    type Pass = EmbeddingPass;

    fn embed(&self, ctx: &StepContext<'_>, params: &ModelParams, modality: Modality, batch: &Batch) -> Result<EmbeddingPass> {
        let features = ctx.features(params, modality, batch)?;
        match ctx.state.heads.get(&embedding_head_name(modality)) {
            Some(head) => {
                let trace = head.forward(&params.heads, &features)?;
                Ok(EmbeddingPass {
                    modality,
                    embeddings: trace.output.clone(),
                    features,
                    trace: Some(trace),
                })
            }
            None => Ok(EmbeddingPass {
                modality,
                embeddings: features.clone(),
                features,
                trace: None,
            }),
        }
    }

    fn embeddings<'p>(&self, pass: &'p EmbeddingPass) -> &'p Array2<f64> {
        &pass.embeddings
    }

    fn backward(
        &self,
        ctx: &StepContext<'_>,
        params: &ModelParams,
        modality: Modality,
        batch: &Batch,
        pass: &EmbeddingPass,
        grad_embeddings: &Array2<f64>,
        gradients: &mut Gradients,
    ) -> Result<()> {
        let grad_features = match (&pass.trace, ctx.state.heads.get(&embedding_head_name(modality))) {
            (Some(trace), Some(head)) => head.backward(&params.heads, trace, grad_embeddings, &mut gradients.heads)?,
            _ => grad_embeddings.clone(),
        };
        let backbone = ctx.backbone_gradients(params, modality, batch, &grad_features)?;
        gradients.backbone.accumulate(&backbone);
        Ok(())
    }

    fn into_report(&self, pass: EmbeddingPass) -> EmbeddingReport {
        EmbeddingReport {
            features: vec![(pass.modality, pass.features)],
            precision: None,
        }
    }
}

/// Episode bookkeeping of a metric scheme: lifecycle check, support/query
/// split, scoring, gradients
pub(crate) struct EpisodeRunner<'a, E, C> {
    pub core: &'a SchemeCore,
    pub embedder: E,
    pub classifier: &'a C,
    pub split: EpisodeSplit,
    /// Let gradients flow through the support-set embeddings
    pub differentiate_support: bool,
}

impl<E: Embedder, C: EpisodeClassifier> EpisodeRunner<'_, E, C> {
    /// View `batch` as an episode; fails with `NotBuilt` before anything else
    pub fn episode<'b>(&self, batch: &'b TaskBatch) -> Result<Cow<'b, Episode>> {
        self.core.built()?;
        batch.episode(self.split)
    }

    /// Score one episode for every output; mean loss across outputs
    pub fn run(&self, episode: &Episode, metrics: &MetricSet, with_gradients: bool) -> Result<(MetricMap, Gradients)> {
        let ctx = self.core.context()?;
        let params = ctx.current_params();
        let modalities: Vec<Modality> = ctx.state.output_shapes.keys().copied().collect();
        let scale = 1.0 / modalities.len().max(1) as f64;

        let mut loss = 0.0;
        let mut modality_losses = BTreeMap::new();
        let mut predictions = BTreeMap::new();
        let mut gradients = Gradients::default();

        for modality in modalities {
            let classes = ctx.state.output_shapes[&modality].num_elements();
            let support = self.embedder.embed(&ctx, &params, modality, &episode.support)?;
            let query = self.embedder.embed(&ctx, &params, modality, &episode.query)?;
            let support_labels = class_labels(&episode.support, modality, classes)?;
            let query_labels = class_labels(&episode.query, modality, classes)?;

            let scores = self.classifier.score(
                self.embedder.embeddings(&support),
                support_labels,
                self.embedder.embeddings(&query),
                query_labels,
                classes,
            )?;
            ensure_finite(scores.loss, &format!("{} episode loss", modality))?;

            if with_gradients {
                self.embedder.backward(
                    &ctx,
                    &params,
                    modality,
                    &episode.query,
                    &query,
                    &(scores.grad_query * scale),
                    &mut gradients,
                )?;
                if self.differentiate_support {
                    self.embedder.backward(
                        &ctx,
                        &params,
                        modality,
                        &episode.support,
                        &support,
                        &(scores.grad_support * scale),
                        &mut gradients,
                    )?;
                }
            }

            loss += scores.loss * scale;
            modality_losses.insert(modality, scores.loss);
            predictions.insert(modality, scores.predictions);
        }

        if !gradients.is_finite() {
            return Err(AdaptationError::unstable("non-finite gradients in metric episode"));
        }
        let out = collect_metrics(metrics, &predictions, &episode.query, &modality_losses, loss)?;
        Ok((out, gradients))
    }

    /// Class scores for the query set. A plain batch too small to split is
    /// its own support set.
    pub fn infer(&self, batch: &TaskBatch) -> Result<Inference> {
        let ctx = self.core.context()?;
        let episode = match batch {
            TaskBatch::Standard(plain) if plain.batch_size() < 2 => {
                plain.check_consistent()?;
                Cow::Owned(Episode::new(plain.clone(), plain.clone()))
            }
            _ => batch.episode(self.split)?,
        };
        let params = ctx.current_params();

        let mut inference = Inference::default();
        for (&modality, shape) in &ctx.state.output_shapes {
            let classes = shape.num_elements();
            let support = self.embedder.embed(&ctx, &params, modality, &episode.support)?;
            let query = self.embedder.embed(&ctx, &params, modality, &episode.query)?;
            let labels = class_labels(&episode.support, modality, classes)?;
            let scores = self.classifier.predict(
                self.embedder.embeddings(&support),
                labels,
                self.embedder.embeddings(&query),
                classes,
            )?;
            let report = self.embedder.into_report(query);
            inference.features.extend(report.features);
            if let Some(precision) = report.precision {
                inference.precisions.insert(modality, precision);
            }
            inference.predictions.insert(modality, scores);
        }
        Ok(inference)
    }
}
