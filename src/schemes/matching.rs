//! Matching networks
//!
//! Every query attends over the individual support examples with
//! `softmax(-distance / temperature)`. The class distribution is the attention
//! mass landing on each class's support examples, kept in log space so far
//! away support sets do not underflow. Predictions are log-probabilities and
//! the loss is the negative log-likelihood of the query labels.

use super::common::{delegate_to_core, SchemeCore};
use super::embedding::{build_metric, EpisodeClassifier, EpisodeRunner, EpisodeScores, FeatureEmbedder};
use super::{AdaptationScheme, Capabilities, DistanceMetric, Inference, MetricConfig, SchemeKind, TrainOutput};
use crate::backbone::SharedBackbone;
use crate::data::{ShapeDict, TaskBatch};
use crate::error::{AdaptationError, Result};
use crate::metrics::loss::log_softmax_rows;
use crate::metrics::{nll_loss, MetricMap, MetricSet};
use crate::nn::ActivationType;
use ndarray::Array2;
use tracing::debug;

/// `ln Σ exp(v)`, `-inf` for an empty set
fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Attention-over-support classifier
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttentionClassifier {
    pub distance: DistanceMetric,
    pub temperature: f64,
}

impl AttentionClassifier {
    /// Log-attention `[query, support]` and class log-probabilities
    /// `[query, classes]`, both computed in log space
    fn attend(
        &self,
        support: &Array2<f64>,
        labels: &[usize],
        query: &Array2<f64>,
        classes: usize,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        if labels.len() != support.nrows() {
            return Err(AdaptationError::config(format!(
                "{} support labels for {} support embeddings",
                labels.len(),
                support.nrows()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&y| y >= classes) {
            return Err(AdaptationError::config(format!(
                "label {} out of range for {} classes",
                bad, classes
            )));
        }
        let distances = self.distance.pairwise(query, support)?;
        let log_attention = log_softmax_rows(&distances.mapv(|d| -d / self.temperature));

        // ln p_c = logsumexp over the class's support examples of ln a_s
        let mut log_probabilities = Array2::from_elem((query.nrows(), classes), f64::NEG_INFINITY);
        let mut in_class = Vec::with_capacity(labels.len());
        for (q, row) in log_attention.rows().into_iter().enumerate() {
            for c in 0..classes {
                in_class.clear();
                in_class.extend(row.iter().zip(labels).filter(|(_, y)| **y == c).map(|(a, _)| *a));
                log_probabilities[[q, c]] = log_sum_exp(&in_class);
            }
        }
        Ok((log_attention, log_probabilities))
    }
}

impl EpisodeClassifier for AttentionClassifier {
    fn predict(&self, support: &Array2<f64>, labels: &[usize], query: &Array2<f64>, classes: usize) -> Result<Array2<f64>> {
        Ok(self.attend(support, labels, query, classes)?.1)
    }

    fn score(
        &self,
        support: &Array2<f64>,
        labels: &[usize],
        query: &Array2<f64>,
        query_labels: &[usize],
        classes: usize,
    ) -> Result<EpisodeScores> {
        let (log_attention, log_probabilities) = self.attend(support, labels, query, classes)?;
        let (loss, grad_log) = nll_loss(&log_probabilities, query_labels)?;

        // d ln p_c / d logit_s = [y_s = c] a_s / p_c - a_s
        let mut grad_logits = Array2::zeros(log_attention.raw_dim());
        for (q, &label) in query_labels.iter().enumerate() {
            let g = grad_log[[q, label]];
            let log_mass = log_probabilities[[q, label]];
            for (s, &y) in labels.iter().enumerate() {
                let log_a = log_attention[[q, s]];
                let within = if y == label { (log_a - log_mass).exp() } else { 0.0 };
                grad_logits[[q, s]] = g * (within - log_a.exp());
            }
        }
        let grad_distances = grad_logits.mapv(|g: f64| -g / self.temperature);
        let (grad_query, grad_support) = self.distance.backward(query, support, &grad_distances)?;

        Ok(EpisodeScores {
            predictions: log_probabilities,
            loss,
            grad_query,
            grad_support,
        })
    }
}

/// Matching network over backbone features, optionally through an embedding
/// head
pub struct MatchingNetworkScheme {
    core: SchemeCore,
    config: MetricConfig,
    classifier: AttentionClassifier,
}

impl MatchingNetworkScheme {
    pub fn new(backbone: SharedBackbone, config: MetricConfig) -> Self {
        Self {
            core: SchemeCore::new(SchemeKind::MatchingNetwork, backbone, config.learner.clone()),
            classifier: AttentionClassifier {
                distance: config.distance,
                temperature: config.temperature,
            },
            config,
        }
    }

    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    fn runner(&self) -> EpisodeRunner<'_, FeatureEmbedder, AttentionClassifier> {
        EpisodeRunner {
            core: &self.core,
            embedder: FeatureEmbedder,
            classifier: &self.classifier,
            split: self.config.episode_split,
            differentiate_support: self.config.differentiate_support,
        }
    }
}

impl AdaptationScheme for MatchingNetworkScheme {
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

    /// The output activation is not used: predictions are log-probabilities
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
