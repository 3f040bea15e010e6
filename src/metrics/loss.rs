//! Loss functions with their gradients
//!
//! Every loss returns the scalar value together with `dL/dprediction`, already
//! divided by the batch (or element) count.

use crate::data::Target;
use crate::error::{AdaptationError, Result};
use ndarray::{Array2, Axis};
use std::f64::consts::PI;

/// Row-wise softmax. Entries equal to `-inf` get probability zero.
pub fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut probs = logits.clone();
    for mut row in probs.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Row-wise log-softmax
pub fn log_softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f64>().ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

fn check_labels(labels: &[usize], rows: usize, classes: usize) -> Result<()> {
    if labels.len() != rows {
        return Err(AdaptationError::config(format!(
            "{} labels for {} predictions",
            labels.len(),
            rows
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&y| y >= classes) {
        return Err(AdaptationError::config(format!(
            "label {} out of range for {} classes",
            bad, classes
        )));
    }
    Ok(())
}

/// Mean cross-entropy of `logits` against class labels
pub fn cross_entropy(logits: &Array2<f64>, labels: &[usize]) -> Result<(f64, Array2<f64>)> {
    let (rows, classes) = logits.dim();
    check_labels(labels, rows, classes)?;
    let n = rows.max(1) as f64;

    let log_probs = log_softmax_rows(logits);
    let loss = -labels.iter().enumerate().map(|(i, &y)| log_probs[[i, y]]).sum::<f64>() / n;

    let mut grad = softmax_rows(logits);
    for (i, &y) in labels.iter().enumerate() {
        grad[[i, y]] -= 1.0;
    }
    grad.mapv_inplace(|g| g / n);
    Ok((loss, grad))
}

/// Mean negative log-likelihood of already normalised log-probabilities
pub fn nll_loss(log_probs: &Array2<f64>, labels: &[usize]) -> Result<(f64, Array2<f64>)> {
    let (rows, classes) = log_probs.dim();
    check_labels(labels, rows, classes)?;
    let n = rows.max(1) as f64;

    let loss = -labels.iter().enumerate().map(|(i, &y)| log_probs[[i, y]]).sum::<f64>() / n;
    let mut grad = Array2::zeros(log_probs.raw_dim());
    for (i, &y) in labels.iter().enumerate() {
        grad[[i, y]] = -1.0 / n;
    }
    Ok((loss, grad))
}

fn check_dense(prediction: &Array2<f64>, target: &Array2<f64>) -> Result<()> {
    if prediction.dim() != target.dim() {
        return Err(AdaptationError::config(format!(
            "prediction shape {:?} does not match target shape {:?}",
            prediction.shape(),
            target.shape()
        )));
    }
    Ok(())
}

/// Mean squared error over all elements
pub fn mse_loss(prediction: &Array2<f64>, target: &Array2<f64>) -> Result<(f64, Array2<f64>)> {
    check_dense(prediction, target)?;
    let n = prediction.len().max(1) as f64;
    let diff = prediction - target;
    let loss = diff.mapv(|d| d * d).sum() / n;
    Ok((loss, diff * (2.0 / n)))
}

/// Gradients of [`gaussian_nll`]
#[derive(Debug, Clone)]
pub struct GaussianNllGrad {
    pub mean: Array2<f64>,
    pub precision: Array2<f64>,
}

/// Mean Gaussian negative log-likelihood parameterised by precision:
/// `0.5 * (prec * (y - mu)^2 - ln(prec) + ln(2 pi))`
pub fn gaussian_nll(mean: &Array2<f64>, precision: &Array2<f64>, target: &Array2<f64>) -> Result<(f64, GaussianNllGrad)> {
    check_dense(mean, target)?;
    check_dense(precision, target)?;
    if let Some(bad) = precision.iter().find(|p| p.is_nan() || **p <= 0.0) {
        return Err(AdaptationError::unstable(format!("non-positive precision {}", bad)));
    }
    let n = mean.len().max(1) as f64;
    let ln_2pi = (2.0 * PI).ln();

    let residual = target - mean;
    let loss = residual
        .iter()
        .zip(precision.iter())
        .map(|(&r, &p)| 0.5 * (p * r * r - p.ln() + ln_2pi))
        .sum::<f64>()
        / n;

    let grad_mean = (precision * &residual).mapv(|v| -v / n);
    let mut grad_precision = residual.mapv(|r| r * r);
    grad_precision.zip_mut_with(precision, |g, &p| *g = 0.5 * (*g - 1.0 / p) / n);

    Ok((
        loss,
        GaussianNllGrad {
            mean: grad_mean,
            precision: grad_precision,
        },
    ))
}

/// Task loss for a prediction: cross-entropy for class targets, MSE for dense
pub fn task_loss(prediction: &Array2<f64>, target: &Target) -> Result<(f64, Array2<f64>)> {
    match target {
        Target::Classes(labels) => cross_entropy(prediction, labels),
        Target::Dense(values) => mse_loss(prediction, values),
    }
}

/// Fail with a numerical instability when `value` is NaN or infinite
pub fn ensure_finite(value: f64, what: &str) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(AdaptationError::unstable(format!("{} is {}", what, value)))
    }
}

/// Index of the largest entry per row
pub fn argmax_rows(scores: &Array2<f64>) -> Vec<usize> {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
                .0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Array2::zeros((2, 4));
        let (loss, grad) = cross_entropy(&logits, &[1, 3]).unwrap();
        assert_abs_diff_eq!(loss, 4f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(grad[[0, 1]], (0.25 - 1.0) / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grad.sum(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cross_entropy_gradient_matches_finite_difference() {
        let logits = array![[0.2, -1.0, 0.7], [1.5, 0.3, -0.4]];
        let labels = [2, 0];
        let (_, grad) = cross_entropy(&logits, &labels).unwrap();
        let eps = 1e-6;
        let mut up = logits.clone();
        up[[1, 1]] += eps;
        let mut down = logits.clone();
        down[[1, 1]] -= eps;
        let numeric = (cross_entropy(&up, &labels).unwrap().0 - cross_entropy(&down, &labels).unwrap().0) / (2.0 * eps);
        assert_abs_diff_eq!(grad[[1, 1]], numeric, epsilon = 1e-8);
    }

    #[test]
    fn test_softmax_handles_negative_infinity() {
        let probs = softmax_rows(&array![[0.0, f64::NEG_INFINITY]]);
        assert_eq!(probs, array![[1.0, 0.0]]);
    }

    #[test]
    fn test_label_out_of_range() {
        assert!(cross_entropy(&Array2::zeros((1, 2)), &[2]).is_err());
    }

    #[test]
    fn test_gaussian_nll_gradients() {
        let mean = array![[0.5, -0.2]];
        let precision = array![[2.0, 0.7]];
        let target = array![[1.0, 0.1]];
        let (_, grad) = gaussian_nll(&mean, &precision, &target).unwrap();
        let eps = 1e-6;

        let mut up = precision.clone();
        up[[0, 1]] += eps;
        let mut down = precision.clone();
        down[[0, 1]] -= eps;
        let numeric = (gaussian_nll(&mean, &up, &target).unwrap().0 - gaussian_nll(&mean, &down, &target).unwrap().0) / (2.0 * eps);
        assert_abs_diff_eq!(grad.precision[[0, 1]], numeric, epsilon = 1e-8);

        let mut up = mean.clone();
        up[[0, 0]] += eps;
        let mut down = mean.clone();
        down[[0, 0]] -= eps;
        let numeric = (gaussian_nll(&up, &precision, &target).unwrap().0 - gaussian_nll(&down, &precision, &target).unwrap().0) / (2.0 * eps);
        assert_abs_diff_eq!(grad.mean[[0, 0]], numeric, epsilon = 1e-8);
    }

    #[test]
    fn test_gaussian_nll_rejects_non_positive_precision() {
        let err = gaussian_nll(&array![[0.0]], &array![[0.0]], &array![[0.0]]).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_argmax_rows() {
        assert_eq!(argmax_rows(&array![[0.1, 0.9], [f64::NEG_INFINITY, -3.0]]), vec![1, 1]);
    }
}
