//! Multivariate Gaussian densities backed by a Cholesky factorisation

use crate::config::CovarianceType;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::f64::consts::PI;

/// Lower-triangular Cholesky factor of a symmetric matrix.
///
/// Returns `None` when a pivot is at or below `tolerance`, i.e. the matrix is
/// not positive definite within numerical tolerance.
pub fn cholesky(matrix: &Array2<f64>, tolerance: f64) -> Option<Array2<f64>> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return None;
    }
    let mut lower = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[[i, j]];
            for k in 0..j {
                sum -= lower[[i, k]] * lower[[j, k]];
            }
            if i == j {
                if !(sum > tolerance) || !sum.is_finite() {
                    return None;
                }
                lower[[i, j]] = sum.sqrt();
            } else {
                lower[[i, j]] = sum / lower[[j, j]];
            }
        }
    }
    Some(lower)
}

/// Numerically stable `ln(sum(exp(values)))`
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Multivariate Gaussian distribution
#[derive(Debug, Clone)]
pub struct Gaussian {
    mean: Array1<f64>,
    covariance: Array2<f64>,
    /// Lower Cholesky factor of the covariance
    chol: Array2<f64>,
    log_det: f64,
}

impl Gaussian {
    /// `None` if the covariance is singular within `tolerance`
    pub fn new(mean: Array1<f64>, covariance: Array2<f64>, tolerance: f64) -> Option<Self> {
        let chol = cholesky(&covariance, tolerance)?;
        let log_det = 2.0 * chol.diag().iter().map(|v| v.ln()).sum::<f64>();
        Some(Self {
            mean,
            covariance,
            chol,
            log_det,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Log probability density at a point
    pub fn log_pdf(&self, x: ArrayView1<f64>) -> f64 {
        let d = self.dim();
        // Forward substitution: L y = x - mu
        let mut y = vec![0.0; d];
        for i in 0..d {
            let mut sum = x[i] - self.mean[i];
            for k in 0..i {
                sum -= self.chol[[i, k]] * y[k];
            }
            y[i] = sum / self.chol[[i, i]];
        }
        let mahalanobis: f64 = y.iter().map(|v| v * v).sum();
        -0.5 * (d as f64 * (2.0 * PI).ln() + self.log_det + mahalanobis)
    }
}

/// Weighted mean of the rows of `data`
pub fn weighted_mean(data: &Array2<f64>, weights: ArrayView1<f64>, total: f64) -> Array1<f64> {
    let mut mean = Array1::zeros(data.ncols());
    for (row, &w) in data.axis_iter(Axis(0)).zip(weights.iter()) {
        mean.scaled_add(w, &row);
    }
    mean / total
}

/// Weighted covariance of the rows of `data` around `mean`, with `floor`
/// added to the diagonal
pub fn weighted_covariance(
    data: &Array2<f64>,
    weights: ArrayView1<f64>,
    total: f64,
    mean: &Array1<f64>,
    covariance_type: CovarianceType,
    floor: f64,
) -> Array2<f64> {
    let d = data.ncols();
    let mut cov = Array2::zeros((d, d));
    for (row, &w) in data.axis_iter(Axis(0)).zip(weights.iter()) {
        let diff = &row - mean;
        match covariance_type {
            CovarianceType::Full => {
                for i in 0..d {
                    for j in 0..=i {
                        cov[[i, j]] += w * diff[i] * diff[j];
                    }
                }
            }
            CovarianceType::Diagonal => {
                for i in 0..d {
                    cov[[i, i]] += w * diff[i] * diff[i];
                }
            }
        }
    }
    cov /= total;
    for i in 0..d {
        for j in 0..i {
            cov[[j, i]] = cov[[i, j]];
        }
        cov[[i, i]] += floor;
    }
    cov
}

/// Unweighted covariance of the rows of `data`
pub fn sample_covariance(data: &Array2<f64>, covariance_type: CovarianceType, floor: f64) -> Array2<f64> {
    let n = data.nrows();
    let weights = Array1::from_elem(n, 1.0);
    let mean = weighted_mean(data, weights.view(), n as f64);
    weighted_covariance(data, weights.view(), n as f64, &mean, covariance_type, floor)
}

/// Row-major nested vectors, for serialisation
pub fn to_nested(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|r| r.to_vec()).collect()
}

/// Inverse of `to_nested`; `None` for ragged input
pub fn from_nested(rows: &[Vec<f64>]) -> Option<Array2<f64>> {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, |r| r.len());
    let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((n_rows, n_cols), flat).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let l = cholesky(&a, 1e-12).unwrap();
        let rebuilt = l.dot(&l.t());
        for (x, y) in rebuilt.iter().zip(a.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_singular_matrix_detected() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(cholesky(&a, 1e-12).is_none());
        assert!(Gaussian::new(array![0.0, 0.0], a, 1e-12).is_none());
    }

    #[test]
    fn test_standard_normal_log_pdf() {
        let g = Gaussian::new(array![0.0], array![[1.0]], 1e-12).unwrap();
        assert_relative_eq!(g.log_pdf(array![0.0].view()), -0.5 * (2.0 * PI).ln(), epsilon = 1e-12);

        let g2 = Gaussian::new(array![1.0, -1.0], array![[2.0, 0.0], [0.0, 0.5]], 1e-12).unwrap();
        // Diagonal covariance: sum of independent 1-D log densities
        let x = array![2.0, 0.0];
        let expected = -0.5 * ((2.0 * PI * 2.0).ln() + 0.5) - 0.5 * ((2.0 * PI * 0.5).ln() + 2.0);
        assert_relative_eq!(g2.log_pdf(x.view()), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_log_sum_exp() {
        assert_relative_eq!(log_sum_exp(&[0.0, 0.0]), 2.0f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(log_sum_exp(&[-1000.0, -1000.0]), -1000.0 + 2.0f64.ln(), epsilon = 1e-9);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_diagonal_covariance_ignores_correlation() {
        let data = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        let full = sample_covariance(&data, CovarianceType::Full, 0.0);
        let diag = sample_covariance(&data, CovarianceType::Diagonal, 0.0);
        assert_relative_eq!(full[[0, 1]], 2.0 / 3.0, epsilon = 1e-12);
        assert_eq!(diag[[0, 1]], 0.0);
        assert_relative_eq!(diag[[1, 1]], 2.0 / 3.0, epsilon = 1e-12);
    }
}
