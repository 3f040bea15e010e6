//! Named metric functions and losses
//!
//! A [`MetricSet`] maps metric names to `(predictions, target) -> f64`
//! functions supplied by the task. Schemes evaluate every metric in the set
//! and add their own `"loss"` entry on top.

pub mod loss;

use crate::data::Target;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use loss::{argmax_rows, cross_entropy, gaussian_nll, mse_loss, nll_loss, softmax_rows, task_loss};

/// Metric name -> value, always containing `"loss"` when returned by a scheme
pub type MetricMap = BTreeMap<String, f64>;

/// `(predictions [batch, out], target) -> scalar`
pub type MetricFn = Arc<dyn Fn(&Array2<f64>, &Target) -> f64 + Send + Sync>;

/// Collection of named metric functions
#[derive(Clone, Default)]
pub struct MetricSet {
    metrics: BTreeMap<String, MetricFn>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: add a metric
    pub fn with<F>(mut self, name: impl Into<String>, metric: F) -> Self
    where
        F: Fn(&Array2<f64>, &Target) -> f64 + Send + Sync + 'static,
    {
        self.metrics.insert(name.into(), Arc::new(metric));
        self
    }

    /// `accuracy` and `cross_entropy`, for class-label tasks
    pub fn classification() -> Self {
        Self::new().with("accuracy", accuracy).with("cross_entropy", cross_entropy_metric)
    }

    /// `mse` and `mae`, for dense regression tasks
    pub fn reconstruction() -> Self {
        Self::new().with("mse", mse).with("mae", mae)
    }

    pub fn names(&self) -> Vec<&str> {
        self.metrics.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Evaluate every metric
    pub fn compute(&self, predictions: &Array2<f64>, target: &Target) -> MetricMap {
        self.metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric(predictions, target)))
            .collect()
    }
}

impl fmt::Debug for MetricSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSet").field("metrics", &self.names()).finish()
    }
}

/// Fraction of rows whose argmax equals the label. NaN for dense targets.
pub fn accuracy(predictions: &Array2<f64>, target: &Target) -> f64 {
    match target {
        Target::Classes(labels) if !labels.is_empty() => {
            let predicted = argmax_rows(predictions);
            let correct = predicted.iter().zip(labels).filter(|(p, y)| p == y).count();
            correct as f64 / labels.len() as f64
        }
        _ => f64::NAN,
    }
}

/// Cross-entropy of the predictions treated as logits
pub fn cross_entropy_metric(predictions: &Array2<f64>, target: &Target) -> f64 {
    match target {
        Target::Classes(labels) => cross_entropy(predictions, labels).map(|(l, _)| l).unwrap_or(f64::NAN),
        Target::Dense(_) => f64::NAN,
    }
}

/// Mean squared error against a dense target
pub fn mse(predictions: &Array2<f64>, target: &Target) -> f64 {
    match target {
        Target::Dense(values) => mse_loss(predictions, values).map(|(l, _)| l).unwrap_or(f64::NAN),
        Target::Classes(_) => f64::NAN,
    }
}

/// Mean absolute error against a dense target
pub fn mae(predictions: &Array2<f64>, target: &Target) -> f64 {
    match target {
        Target::Dense(values) if values.dim() == predictions.dim() && !values.is_empty() => {
            (predictions - values).mapv(f64::abs).mean().unwrap_or(f64::NAN)
        }
        _ => f64::NAN,
    }
}

/// Prefix every key: `"{prefix}_{key}"`
pub fn prefixed(metrics: &MetricMap, prefix: &str) -> MetricMap {
    metrics
        .iter()
        .map(|(k, v)| (format!("{}_{}", prefix, k), *v))
        .collect()
}

/// Running means of metric maps across batches
#[derive(Debug, Clone, Default)]
pub struct MetricAverager {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
}

impl MetricAverager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch worth of metrics. Non-finite values are not averaged.
    pub fn add(&mut self, metrics: &MetricMap) {
        for (name, &value) in metrics {
            if value.is_finite() {
                *self.sums.entry(name.clone()).or_insert(0.0) += value;
                *self.counts.entry(name.clone()).or_insert(0) += 1;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn means(&self) -> MetricMap {
        self.sums
            .iter()
            .filter_map(|(name, sum)| {
                self.counts
                    .get(name)
                    .filter(|&&c| c > 0)
                    .map(|&c| (name.clone(), sum / c as f64))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_accuracy() {
        let preds = array![[0.9, 0.1], [0.2, 0.8], [0.6, 0.4]];
        let acc = accuracy(&preds, &Target::Classes(vec![0, 1, 1]));
        assert_abs_diff_eq!(acc, 2.0 / 3.0, epsilon = 1e-12);
        assert!(accuracy(&preds, &Target::Dense(Array2::zeros((3, 2)))).is_nan());
    }

    #[test]
    fn test_reconstruction_metrics() {
        let metrics = MetricSet::reconstruction();
        let out = metrics.compute(&array![[1.0, 2.0]], &Target::Dense(array![[0.0, 4.0]]));
        assert_abs_diff_eq!(out["mse"], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(out["mae"], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_custom_metric_and_prefix() {
        let metrics = MetricSet::new().with("rows", |p: &Array2<f64>, _: &Target| p.nrows() as f64);
        let out = metrics.compute(&Array2::zeros((4, 1)), &Target::Classes(vec![0; 4]));
        assert_eq!(prefixed(&out, "image")["image_rows"], 4.0);
    }

    #[test]
    fn test_averager_skips_non_finite() {
        let mut avg = MetricAverager::new();
        avg.add(&MetricMap::from([("loss".to_string(), 1.0), ("acc".to_string(), f64::NAN)]));
        avg.add(&MetricMap::from([("loss".to_string(), 3.0), ("acc".to_string(), 0.5)]));
        let means = avg.means();
        assert_eq!(means["loss"], 2.0);
        assert_eq!(means["acc"], 0.5);
    }
}
