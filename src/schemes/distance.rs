//! Distance functions for metric-based schemes

use crate::error::{AdaptationError, Result};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

const NORM_EPS: f64 = 1e-8;

/// Distance between embeddings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// sum((x-y)^2), the usual choice for prototypical networks
    SquaredEuclidean,
    /// sqrt(sum((x-y)^2))
    Euclidean,
    /// 1 - (x·y)/(||x|| ||y||), 1 when either vector is zero
    Cosine,
    /// sum(|x-y|)
    Manhattan,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        Self::SquaredEuclidean
    }
}

impl DistanceMetric {
    /// Distance between two vectors
    pub fn compute(&self, a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        match self {
            DistanceMetric::SquaredEuclidean => {
                let diff = &a - &b;
                diff.dot(&diff)
            }
            DistanceMetric::Euclidean => {
                let diff = &a - &b;
                diff.dot(&diff).sqrt()
            }
            DistanceMetric::Cosine => {
                let norm_a = a.dot(&a).sqrt();
                let norm_b = b.dot(&b).sqrt();
                if norm_a < NORM_EPS || norm_b < NORM_EPS {
                    return 1.0;
                }
                1.0 - a.dot(&b) / (norm_a * norm_b)
            }
            DistanceMetric::Manhattan => a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum(),
        }
    }

    /// `[n, d] x [m, d] -> [n, m]`
    pub fn pairwise(&self, a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>> {
        check_widths(a, b)?;
        Ok(Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
            self.compute(a.row(i), b.row(j))
        }))
    }

    /// Gradient of `sum(grad ⊙ pairwise(a, b))` with respect to `a` and `b`
    pub fn backward(&self, a: &Array2<f64>, b: &Array2<f64>, grad: &Array2<f64>) -> Result<(Array2<f64>, Array2<f64>)> {
        check_widths(a, b)?;
        if grad.dim() != (a.nrows(), b.nrows()) {
            return Err(AdaptationError::config(format!(
                "distance gradient shape {:?} does not match {}x{}",
                grad.shape(),
                a.nrows(),
                b.nrows()
            )));
        }
        let mut grad_a = Array2::zeros(a.raw_dim());
        let mut grad_b = Array2::zeros(b.raw_dim());

        for (i, x) in a.axis_iter(Axis(0)).enumerate() {
            for (j, y) in b.axis_iter(Axis(0)).enumerate() {
                let g = grad[[i, j]];
                if g == 0.0 {
                    continue;
                }
                match self {
                    DistanceMetric::SquaredEuclidean => {
                        let diff = &x - &y;
                        grad_a.row_mut(i).scaled_add(2.0 * g, &diff);
                        grad_b.row_mut(j).scaled_add(-2.0 * g, &diff);
                    }
                    DistanceMetric::Euclidean => {
                        let diff = &x - &y;
                        let dist = diff.dot(&diff).sqrt();
                        if dist > NORM_EPS {
                            grad_a.row_mut(i).scaled_add(g / dist, &diff);
                            grad_b.row_mut(j).scaled_add(-g / dist, &diff);
                        }
                    }
                    DistanceMetric::Cosine => {
                        let norm_x = x.dot(&x).sqrt();
                        let norm_y = y.dot(&y).sqrt();
                        if norm_x < NORM_EPS || norm_y < NORM_EPS {
                            continue;
                        }
                        let cos = x.dot(&y) / (norm_x * norm_y);
                        // d(1 - cos)/dx = -(y / (|x||y|) - cos * x / |x|^2)
                        let scale = g / (norm_x * norm_y);
                        grad_a.row_mut(i).scaled_add(-scale, &y);
                        grad_a.row_mut(i).scaled_add(g * cos / (norm_x * norm_x), &x);
                        grad_b.row_mut(j).scaled_add(-scale, &x);
                        grad_b.row_mut(j).scaled_add(g * cos / (norm_y * norm_y), &y);
                    }
                    DistanceMetric::Manhattan => {
                        let sign = (&x - &y).mapv(f64::signum);
                        grad_a.row_mut(i).scaled_add(g, &sign);
                        grad_b.row_mut(j).scaled_add(-g, &sign);
                    }
                }
            }
        }
        Ok((grad_a, grad_b))
    }
}

fn check_widths(a: &Array2<f64>, b: &Array2<f64>) -> Result<()> {
    if a.ncols() != b.ncols() {
        return Err(AdaptationError::config(format!(
            "cannot compare embeddings of width {} and {}",
            a.ncols(),
            b.ncols()
        )));
    }
    Ok(())
}
