//! Prototypical and matching networks over POEM expert heads
//!
//! Every input modality is an expert with a mean and a precision head. The
//! product-of-Gaussians fusion of the experts an example observed is its
//! embedding, so examples missing a modality still land in the shared space
//! the episode is classified in.

use super::common::{delegate_to_core, BuildPlan, SchemeCore, StepContext};
use super::embedding::{EmbeddingReport, Embedder, EpisodeClassifier, EpisodeRunner, EpisodeScores};
use super::matching::AttentionClassifier;
use super::poem::{
    backward_output, expert_backbone_gradients, expert_features, expert_heads, output_pass, ExpertFeatures,
    FusionGradients, OutputPass,
};
use super::prototypical::PrototypeClassifier;
use super::{AdaptationScheme, Capabilities, Inference, PoemConfig, PoemHeadMetricConfig, SchemeKind, TrainOutput};
use crate::backbone::SharedBackbone;
use crate::data::{Batch, Modality, ShapeDict, TaskBatch};
use crate::error::{AdaptationError, Result};
use crate::metrics::{MetricMap, MetricSet};
use crate::nn::{ActivationType, Gradients, ModelParams};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Fused expert means as embeddings
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExpertEmbedder<'c> {
    config: &'c PoemConfig,
}

pub(crate) struct FusedPass {
    experts: BTreeMap<Modality, ExpertFeatures>,
    pass: OutputPass,
}

impl Embedder for ExpertEmbedder<'_> {
    type Pass = FusedPass;

    fn embed(&self, ctx: &StepContext<'_>, params: &ModelParams, output: Modality, batch: &Batch) -> Result<FusedPass> {
        let experts = expert_features(self.config, ctx, params, batch)?;
        let pass = output_pass(self.config, ctx, params, output, &experts, batch)?;
        Ok(FusedPass { experts, pass })
    }

    fn embeddings<'p>(&self, pass: &'p FusedPass) -> &'p Array2<f64> {
        &pass.pass.fused.mean
    }

    fn backward(
        &self,
        ctx: &StepContext<'_>,
        params: &ModelParams,
        output: Modality,
        batch: &Batch,
        pass: &FusedPass,
        grad_embeddings: &Array2<f64>,
        gradients: &mut Gradients,
    ) -> Result<()> {
        let mut fusion = FusionGradients::default();
        let no_precision_loss = Array2::zeros(grad_embeddings.raw_dim());
        backward_output(ctx, params, output, &pass.pass, (grad_embeddings, &no_precision_loss), &mut fusion)?;
        gradients.heads.accumulate(&fusion.heads);
        let backbone = expert_backbone_gradients(ctx, params, batch, &pass.experts, fusion.inputs)?;
        gradients.backbone.accumulate(&backbone);
        Ok(())
    }

    fn into_report(&self, pass: FusedPass) -> EmbeddingReport {
        EmbeddingReport {
            features: pass.experts.into_iter().map(|(m, e)| (m, e.features)).collect(),
            precision: Some(pass.pass.fused.precision),
        }
    }
}

/// The two classifiers this scheme can score fused embeddings with
#[derive(Debug, Clone, Copy)]
enum FusedClassifier {
    Prototypes(PrototypeClassifier),
    Attention(AttentionClassifier),
}

impl EpisodeClassifier for FusedClassifier {
    fn predict(&self, support: &Array2<f64>, labels: &[usize], query: &Array2<f64>, classes: usize) -> Result<Array2<f64>> {
        match self {
            FusedClassifier::Prototypes(c) => c.predict(support, labels, query, classes),
            FusedClassifier::Attention(c) => c.predict(support, labels, query, classes),
        }
    }

    fn score(
        &self,
        support: &Array2<f64>,
        labels: &[usize],
        query: &Array2<f64>,
        query_labels: &[usize],
        classes: usize,
    ) -> Result<EpisodeScores> {
        match self {
            FusedClassifier::Prototypes(c) => c.score(support, labels, query, query_labels, classes),
            FusedClassifier::Attention(c) => c.score(support, labels, query, query_labels, classes),
        }
    }
}

/// Prototypical or matching network whose embedding is the POEM fusion of
/// per-modality expert heads
pub struct PoemHeadMetricScheme {
    core: SchemeCore,
    config: PoemHeadMetricConfig,
    classifier: FusedClassifier,
}

impl PoemHeadMetricScheme {
    /// Distance-to-prototype classification of fused embeddings
    pub fn prototypical(backbone: SharedBackbone, config: PoemHeadMetricConfig) -> Self {
        let classifier = FusedClassifier::Prototypes(PrototypeClassifier {
            distance: config.distance,
            temperature: config.temperature,
        });
        Self::new(SchemeKind::PrototypicalNetworkPoemHead, backbone, config, classifier)
    }

    /// Attention over individual fused support embeddings
    pub fn matching(backbone: SharedBackbone, config: PoemHeadMetricConfig) -> Self {
        let classifier = FusedClassifier::Attention(AttentionClassifier {
            distance: config.distance,
            temperature: config.temperature,
        });
        Self::new(SchemeKind::MatchingNetworkPoemHead, backbone, config, classifier)
    }

    fn new(kind: SchemeKind, backbone: SharedBackbone, config: PoemHeadMetricConfig, classifier: FusedClassifier) -> Self {
        Self {
            core: SchemeCore::new(kind, backbone, config.experts.learner.clone()),
            config,
            classifier,
        }
    }

    pub fn config(&self) -> &PoemHeadMetricConfig {
        &self.config
    }

    fn runner(&self) -> EpisodeRunner<'_, ExpertEmbedder<'_>, FusedClassifier> {
        EpisodeRunner {
            core: &self.core,
            embedder: ExpertEmbedder {
                config: &self.config.experts,
            },
            classifier: &self.classifier,
            split: self.config.episode_split,
            differentiate_support: self.config.differentiate_support,
        }
    }
}

impl AdaptationScheme for PoemHeadMetricScheme {
    fn kind(&self) -> SchemeKind {
        self.core.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            episodic: true,
            inner_loop: false,
            metric_based: true,
            fuses_experts: true,
            updates_backbone: self.config.experts.fine_tune_all_layers,
        }
    }

    /// One expert per input modality and one set of expert heads per class
    /// output. The output activation is not used.
    fn build(&mut self, input_shapes: &ShapeDict, output_shapes: &ShapeDict, _output_activation: ActivationType) -> Result<()> {
        self.config.validate()?;
        if input_shapes.is_empty() {
            return Err(AdaptationError::config("input shape dict is empty"));
        }
        if output_shapes.is_empty() {
            return Err(AdaptationError::config("output shape dict is empty"));
        }
        for (modality, shape) in output_shapes {
            if !shape.is_classification() {
                return Err(AdaptationError::config(format!(
                    "metric-based schemes classify; '{}' output is not a class label",
                    modality
                )));
            }
        }
        let experts: BTreeSet<Modality> = input_shapes.keys().copied().collect();
        let mut rng = StdRng::seed_from_u64(self.core.learner.seed);
        let feature_shapes = self.core.discover_features(input_shapes, &experts, &mut rng)?;

        let width = if self.config.experts.use_mean_head {
            self.config.embedding_dim
        } else {
            feature_shapes.values().next().map(|d| d.iter().product::<usize>()).unwrap_or(0)
        };
        let outputs: Vec<(Modality, usize)> = output_shapes.keys().map(|&m| (m, width)).collect();
        let heads = expert_heads(&self.config.experts, &outputs, &feature_shapes, ActivationType::Linear)?;

        self.core.install(BuildPlan {
            input_shapes: input_shapes.clone(),
            output_shapes: output_shapes.clone(),
            feature_shapes,
            heads,
            updates_backbone: self.config.experts.fine_tune_all_layers,
            rng,
        })
    }

    fn train_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<TrainOutput> {
        let runner = self.runner();
        let episode = runner.episode(batch)?;
        let (metrics, gradients) = runner.run(&episode, metrics, true)?;
        debug!(
            scheme = self.name(),
            support = episode.support_size(),
            query = episode.query_size(),
            loss = metrics.get("loss").copied().unwrap_or(f64::NAN),
            "Fused episode step"
        );
        Ok(TrainOutput { metrics, gradients })
    }

    fn eval_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<MetricMap> {
        let runner = self.runner();
        let episode = runner.episode(batch)?;
        Ok(runner.run(&episode, metrics, false)?.0)
    }

    fn inference_step(&self, batch: &TaskBatch) -> Result<Inference> {
        self.runner().infer(batch)
    }

    delegate_to_core!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::IdentityBackbone;
    use crate::data::{Episode, ShapeDescriptor, Target};
    use crate::heads::HeadConfig;
    use crate::schemes::{MetricConfig, PrototypicalNetworkScheme};
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};

    fn two_expert_shapes() -> (ShapeDict, ShapeDict) {
        (
            ShapeDict::from([
                (Modality::Image, ShapeDescriptor::new(vec![3])),
                (Modality::Audio, ShapeDescriptor::new(vec![2])),
            ]),
            ShapeDict::from([(Modality::Image, ShapeDescriptor::classes(3))]),
        )
    }

    fn two_expert_batch(labels: Vec<usize>, seed: f64) -> Batch {
        let n = labels.len();
        let bump = labels.clone();
        Batch::new()
            .with_input(
                Modality::Image,
                ArrayD::from_shape_fn(IxDyn(&[n, 3]), |i| {
                    let on = if i[1] == bump[i[0]] { 1.5 } else { 0.0 };
                    on + ((i[0] * 3 + i[1]) as f64 * seed).sin() * 0.3
                }),
            )
            .with_input(
                Modality::Audio,
                ArrayD::from_shape_fn(IxDyn(&[n, 2]), |i| ((i[0] * 2 + i[1]) as f64 * seed * 1.7).cos()),
            )
            .with_observed(Modality::Audio, (0..n).map(|i| i % 3 != 1).collect())
            .with_target(Modality::Image, Target::Classes(labels))
    }

    fn linear_config() -> PoemHeadMetricConfig {
        PoemHeadMetricConfig {
            experts: PoemConfig {
                mean_head: HeadConfig::Linear,
                precision_head: HeadConfig::Linear,
                fine_tune_all_layers: false,
                ..PoemConfig::default()
            },
            embedding_dim: 3,
            ..PoemHeadMetricConfig::default()
        }
    }

    #[test]
    fn test_single_expert_without_heads_matches_prototypical() {
        let inputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::new(vec![3]))]);
        let outputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::classes(3))]);
        let config = PoemHeadMetricConfig {
            experts: PoemConfig {
                use_mean_head: false,
                use_precision_head: false,
                use_input_instance_norm: false,
                fine_tune_all_layers: false,
                ..PoemConfig::default()
            },
            ..PoemHeadMetricConfig::default()
        };
        let mut fused = PoemHeadMetricScheme::prototypical(SharedBackbone::new(IdentityBackbone::new()), config);
        fused.build(&inputs, &outputs, ActivationType::Linear).unwrap();
        assert!(fused.head_parameters().unwrap().is_empty());

        let plain_config = MetricConfig {
            fine_tune_backbone: false,
            ..MetricConfig::default()
        };
        let mut plain = PrototypicalNetworkScheme::new(SharedBackbone::new(IdentityBackbone::new()), plain_config);
        plain.build(&inputs, &outputs, ActivationType::Linear).unwrap();

        let image_only = |labels: Vec<usize>, seed: f64| {
            let mut batch = two_expert_batch(labels, seed);
            batch.inputs.remove(&Modality::Audio);
            batch.observed.clear();
            batch
        };
        let episode: TaskBatch = Episode::new(image_only(vec![0, 1, 2, 0], 0.4), image_only(vec![2, 1], 0.9)).into();
        let a = fused.inference_step(&episode).unwrap().predictions[&Modality::Image].clone();
        let b = plain.inference_step(&episode).unwrap().predictions[&Modality::Image].clone();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_expert_head_gradients_match_finite_difference() {
        let (inputs, outputs) = two_expert_shapes();
        let mut scheme = PoemHeadMetricScheme::prototypical(SharedBackbone::new(IdentityBackbone::new()), linear_config());
        scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();

        let task: TaskBatch = Episode::new(
            two_expert_batch(vec![0, 1, 2, 0, 1, 2], 0.3),
            two_expert_batch(vec![1, 2, 0], 0.8),
        )
        .into();
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
            assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-5);
            scheme.core.built_mut().unwrap().head_params = original;
        }
    }

    #[test]
    fn test_matching_variant_reports_fused_precision() {
        let (inputs, outputs) = two_expert_shapes();
        let mut scheme = PoemHeadMetricScheme::matching(SharedBackbone::new(IdentityBackbone::new()), linear_config());
        scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();
        assert_eq!(scheme.name(), "MatchingNetworkPOEMHead");

        let task: TaskBatch =
            Episode::new(two_expert_batch(vec![0, 1, 2], 0.5), two_expert_batch(vec![2, 0], 0.7)).into();
        let inference = scheme.inference_step(&task).unwrap();
        let log_p = &inference.predictions[&Modality::Image];
        assert_eq!(log_p.dim(), (2, 3));
        for row in log_p.rows() {
            assert_abs_diff_eq!(row.mapv(f64::exp).sum(), 1.0, epsilon = 1e-12);
        }
        let precision = &inference.precisions[&Modality::Image];
        assert_eq!(precision.dim(), (2, 3));
        assert!(precision.iter().all(|&p| p > 0.0));
        assert_eq!(inference.features.len(), 2);
    }

    #[test]
    fn test_label_outputs_required() {
        let (inputs, _) = two_expert_shapes();
        let outputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::dense(vec![2]))]);
        let mut scheme = PoemHeadMetricScheme::prototypical(SharedBackbone::new(IdentityBackbone::new()), linear_config());
        assert!(matches!(
            scheme.build(&inputs, &outputs, ActivationType::Linear),
            Err(AdaptationError::Configuration(_))
        ));
    }
}
