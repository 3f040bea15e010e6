//! Prototypical networks
//!
//! Each class present in the support set is represented by the mean of its
//! support embeddings. Queries are scored by `-distance / temperature` to every
//! prototype and trained with cross-entropy on the query set. Classes with no
//! support example score `-inf`.

use super::common::{delegate_to_core, SchemeCore};
use super::embedding::{build_metric, EpisodeClassifier, EpisodeRunner, EpisodeScores, FeatureEmbedder};
use super::{AdaptationScheme, Capabilities, DistanceMetric, Inference, MetricConfig, SchemeKind, TrainOutput};
use crate::backbone::SharedBackbone;
use crate::data::{ShapeDict, TaskBatch};
use crate::error::{AdaptationError, Result};
use crate::metrics::{cross_entropy, MetricMap, MetricSet};
use crate::nn::ActivationType;
use ndarray::{Array1, Array2};
use tracing::debug;

/// Class means of the support embeddings
#[derive(Debug, Clone)]
pub(crate) struct Prototypes {
    /// `[classes, dim]`, zero rows for absent classes
    pub centroids: Array2<f64>,
    pub counts: Vec<usize>,
}

impl Prototypes {
    pub fn compute(support: &Array2<f64>, labels: &[usize], classes: usize) -> Result<Self> {
        if labels.len() != support.nrows() {
            return Err(AdaptationError::config(format!(
                "{} support labels for {} support embeddings",
                labels.len(),
                support.nrows()
            )));
        }
        let mut centroids = Array2::zeros((classes, support.ncols()));
        let mut counts = vec![0usize; classes];
        for (row, &label) in support.rows().into_iter().zip(labels) {
            if label >= classes {
                return Err(AdaptationError::config(format!(
                    "label {} out of range for {} classes",
                    label, classes
                )));
            }
            centroids.row_mut(label).scaled_add(1.0, &row);
            counts[label] += 1;
        }
        for (mut centroid, &count) in centroids.rows_mut().into_iter().zip(&counts) {
            if count > 0 {
                centroid.mapv_inplace(|v| v / count as f64);
            }
        }
        Ok(Self { centroids, counts })
    }

    pub fn is_present(&self, class: usize) -> bool {
        self.counts.get(class).copied().unwrap_or(0) > 0
    }
}

/// Distance-to-prototype classifier
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrototypeClassifier {
    pub distance: DistanceMetric,
    pub temperature: f64,
}

impl PrototypeClassifier {
    fn scores(&self, prototypes: &Prototypes, query: &Array2<f64>) -> Result<Array2<f64>> {
        let distances = self.distance.pairwise(query, &prototypes.centroids)?;
        let mut scores = distances.mapv(|d| -d / self.temperature);
        for (class, mut column) in scores.columns_mut().into_iter().enumerate() {
            if !prototypes.is_present(class) {
                column.fill(f64::NEG_INFINITY);
            }
        }
        Ok(scores)
    }
}

impl EpisodeClassifier for PrototypeClassifier {
    fn predict(&self, support: &Array2<f64>, labels: &[usize], query: &Array2<f64>, classes: usize) -> Result<Array2<f64>> {
        let prototypes = Prototypes::compute(support, labels, classes)?;
        self.scores(&prototypes, query)
    }

    fn score(
        &self,
        support: &Array2<f64>,
        labels: &[usize],
        query: &Array2<f64>,
        query_labels: &[usize],
        classes: usize,
    ) -> Result<EpisodeScores> {
        let prototypes = Prototypes::compute(support, labels, classes)?;
        let scores = self.scores(&prototypes, query)?;
        let (loss, grad_scores) = cross_entropy(&scores, query_labels)?;

        // scores = -d / T; absent classes carry zero probability and gradient
        let mut grad_distances = grad_scores.mapv(|g| -g / self.temperature);
        for (class, mut column) in grad_distances.columns_mut().into_iter().enumerate() {
            if !prototypes.is_present(class) {
                column.fill(0.0);
            }
        }
        let (grad_query, grad_prototypes) = self.distance.backward(query, &prototypes.centroids, &grad_distances)?;

        // dP_c / dS_i = 1 / n_c for every support example of class c
        let inverse_counts = Array1::from_iter(prototypes.counts.iter().map(|&n| if n > 0 { 1.0 / n as f64 } else { 0.0 }));
        let mut grad_support = Array2::zeros(support.raw_dim());
        for (mut row, &label) in grad_support.rows_mut().into_iter().zip(labels) {
            row.scaled_add(inverse_counts[label], &grad_prototypes.row(label));
        }

        Ok(EpisodeScores {
            predictions: scores,
            loss,
            grad_query,
            grad_support,
        })
    }
}

/// Prototypical network over backbone features, optionally through an
/// embedding head
pub struct PrototypicalNetworkScheme {
    core: SchemeCore,
    config: MetricConfig,
    classifier: PrototypeClassifier,
}

impl PrototypicalNetworkScheme {
    pub fn new(backbone: SharedBackbone, config: MetricConfig) -> Self {
        Self {
            core: SchemeCore::new(SchemeKind::PrototypicalNetwork, backbone, config.learner.clone()),
            classifier: PrototypeClassifier {
                distance: config.distance,
                temperature: config.temperature,
            },
            config,
        }
    }

    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    fn runner(&self) -> EpisodeRunner<'_, FeatureEmbedder, PrototypeClassifier> {
        EpisodeRunner {
            core: &self.core,
            embedder: FeatureEmbedder,
            classifier: &self.classifier,
            split: self.config.episode_split,
            differentiate_support: self.config.differentiate_support,
        }
    }
}

impl AdaptationScheme for PrototypicalNetworkScheme {
    fn kind(&self) -> SchemeKind {
        self.core.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            episodic: true,
            inner_loop: false,
            metric_based: true,
            fuses_experts: false,
            updates_backbone: self.config.fine_tune_backbone,
        }
    }

    /// The output activation is not used: predictions are distance scores
    fn build(&mut self, input_shapes: &ShapeDict, output_shapes: &ShapeDict, _output_activation: ActivationType) -> Result<()> {
        build_metric(&mut self.core, &self.config, input_shapes, output_shapes)
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
            "Episode step"
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
