//! Gaussian mixture model fitted by expectation-maximisation

use super::init::kmeans;
use super::linalg::{from_nested, log_sum_exp, to_nested, weighted_covariance, weighted_mean, Gaussian};
use crate::config::{CovarianceType, GmmConfig};
use crate::error::{LiquidityError, Result};
use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

pub const MODEL_NAME: &str = "gmm";

/// Guards empty components against division by zero
const COMPONENT_FLOOR: f64 = 10.0 * f64::EPSILON;

/// Persistable parameters of a fitted mixture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmmParams {
    pub covariance_type: CovarianceType,
    pub weights: Vec<f64>,
    pub means: Vec<Vec<f64>>,
    pub covariances: Vec<Vec<Vec<f64>>>,
    /// Mean per-sample log-likelihood at convergence
    pub log_likelihood: f64,
    pub n_iter: usize,
    pub converged: bool,
    /// Seed of the winning restart
    pub seed: u64,
}

/// Fitted mixture ready to score observations
#[derive(Debug, Clone)]
pub struct GmmFit {
    params: GmmParams,
    components: Vec<Gaussian>,
}

/// Gaussian mixture estimator
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    n_components: usize,
    seed: u64,
    config: GmmConfig,
    singular_tolerance: f64,
}

impl GaussianMixture {
    pub fn new(n_components: usize, seed: u64, config: GmmConfig, singular_tolerance: f64) -> Self {
        Self {
            n_components,
            seed,
            config,
            singular_tolerance,
        }
    }

    /// Fit the mixture, keeping the best of `n_init` seeded restarts.
    ///
    /// Restart `i` uses seed `seed + i`; ties keep the earliest restart.
    pub fn fit(&self, data: &Array2<f64>) -> Result<GmmFit> {
        super::check_sample_size(MODEL_NAME, data, self.n_components)?;

        let mut best: Option<GmmFit> = None;
        for init in 0..self.config.n_init {
            let seed = self.seed.wrapping_add(init as u64);
            let fit = self.fit_once(data, seed)?;
            debug!(
                "GMM restart seed={} log-likelihood={:.6} iterations={}",
                seed, fit.params.log_likelihood, fit.params.n_iter
            );
            let better = best
                .as_ref()
                .map_or(true, |b| fit.params.log_likelihood > b.params.log_likelihood);
            if better {
                best = Some(fit);
            }
        }

        let best = best.ok_or_else(|| LiquidityError::ModelFit {
            model: MODEL_NAME.to_string(),
            message: "no restarts configured".to_string(),
        })?;
        info!(
            "GMM fitted: K={} seed={} log-likelihood={:.6} iterations={} converged={}",
            self.n_components,
            best.params.seed,
            best.params.log_likelihood,
            best.params.n_iter,
            best.params.converged
        );
        Ok(best)
    }

    fn fit_once(&self, data: &Array2<f64>, seed: u64) -> Result<GmmFit> {
        let k = self.n_components;
        let mut rng = StdRng::seed_from_u64(seed);
        let (_, assignments) = kmeans(data, k, 100, &mut rng);

        let mut resp = Array2::<f64>::zeros((data.nrows(), k));
        for (row, &a) in assignments.iter().enumerate() {
            resp[[row, a]] = 1.0;
        }

        let mut fit = self.m_step(data, &resp, seed)?;
        let mut previous = f64::NEG_INFINITY;
        for iter in 1..=self.config.max_iter {
            let (log_resp, log_likelihood) = fit.e_step(data);
            if !log_likelihood.is_finite() {
                return Err(LiquidityError::ModelFit {
                    model: MODEL_NAME.to_string(),
                    message: format!("non-finite log-likelihood at iteration {}", iter),
                });
            }
            let resp = log_resp.mapv(f64::exp);
            let converged = (log_likelihood - previous).abs() < self.config.tol;
            fit = self.m_step(data, &resp, seed)?;
            fit.params.n_iter = iter;
            fit.params.log_likelihood = log_likelihood;
            previous = log_likelihood;
            if converged {
                fit.params.converged = true;
                break;
            }
        }

        // Score the final parameters
        let (_, log_likelihood) = fit.e_step(data);
        fit.params.log_likelihood = log_likelihood;
        Ok(fit)
    }

    fn m_step(&self, data: &Array2<f64>, resp: &Array2<f64>, seed: u64) -> Result<GmmFit> {
        let n = data.nrows() as f64;
        let k = self.n_components;
        let mut weights = Vec::with_capacity(k);
        let mut components = Vec::with_capacity(k);

        for c in 0..k {
            let column = resp.column(c);
            let nk = column.sum() + COMPONENT_FLOOR;
            let mean = weighted_mean(data, column, nk);
            let covariance = weighted_covariance(
                data,
                column,
                nk,
                &mean,
                self.config.covariance,
                self.config.reg_covar,
            );
            let component = Gaussian::new(mean, covariance, self.singular_tolerance).ok_or_else(|| {
                LiquidityError::SingularCovariance {
                    model: MODEL_NAME.to_string(),
                    component: c,
                }
            })?;
            weights.push(nk / n);
            components.push(component);
        }

        Ok(GmmFit::from_components(
            self.config.covariance,
            weights,
            components,
            seed,
        ))
    }
}

impl GmmFit {
    fn from_components(covariance_type: CovarianceType, weights: Vec<f64>, components: Vec<Gaussian>, seed: u64) -> Self {
        let params = GmmParams {
            covariance_type,
            weights,
            means: components.iter().map(|g| g.mean().to_vec()).collect(),
            covariances: components.iter().map(|g| to_nested(g.covariance())).collect(),
            log_likelihood: f64::NEG_INFINITY,
            n_iter: 0,
            converged: false,
            seed,
        };
        Self { params, components }
    }

    /// Rebuild a fit from persisted parameters
    pub fn from_params(params: GmmParams, singular_tolerance: f64) -> Result<Self> {
        let mut components = Vec::with_capacity(params.means.len());
        for (c, (mean, cov)) in params.means.iter().zip(&params.covariances).enumerate() {
            let covariance = from_nested(cov).ok_or_else(|| LiquidityError::ModelFit {
                model: MODEL_NAME.to_string(),
                message: format!("malformed covariance for component {}", c),
            })?;
            let component = Gaussian::new(Array1::from(mean.clone()), covariance, singular_tolerance)
                .ok_or_else(|| LiquidityError::SingularCovariance {
                    model: MODEL_NAME.to_string(),
                    component: c,
                })?;
            components.push(component);
        }
        Ok(Self { params, components })
    }

    pub fn params(&self) -> &GmmParams {
        &self.params
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    /// Log responsibilities and mean per-sample log-likelihood
    fn e_step(&self, data: &Array2<f64>) -> (Array2<f64>, f64) {
        let k = self.components.len();
        let log_weights: Vec<f64> = self.params.weights.iter().map(|w| w.ln()).collect();
        let mut log_resp = Array2::zeros((data.nrows(), k));
        let mut total = 0.0;
        let mut scratch = vec![0.0; k];

        for (row_idx, row) in data.axis_iter(Axis(0)).enumerate() {
            for c in 0..k {
                scratch[c] = log_weights[c] + self.components[c].log_pdf(row);
            }
            let norm = log_sum_exp(&scratch);
            total += norm;
            for c in 0..k {
                log_resp[[row_idx, c]] = scratch[c] - norm;
            }
        }

        let n = data.nrows().max(1) as f64;
        (log_resp, total / n)
    }

    /// Posterior probability of every component for every row
    pub fn responsibilities(&self, data: &Array2<f64>) -> Array2<f64> {
        self.e_step(data).0.mapv(f64::exp)
    }

    /// Mean per-sample log-likelihood of `data`
    pub fn score(&self, data: &Array2<f64>) -> f64 {
        self.e_step(data).1
    }

    /// Hard assignment: arg-max responsibility, lowest index on ties
    pub fn predict(&self, data: &Array2<f64>) -> Vec<usize> {
        super::argmax_rows(&self.responsibilities(data))
    }

    /// Reorder components so that new index `i` is old index `order[i]`
    pub fn permuted(&self, order: &[usize]) -> Self {
        let components: Vec<Gaussian> = order.iter().map(|&o| self.components[o].clone()).collect();
        let mut params = self.params.clone();
        params.weights = order.iter().map(|&o| self.params.weights[o]).collect();
        params.means = order.iter().map(|&o| self.params.means[o].clone()).collect();
        params.covariances = order.iter().map(|&o| self.params.covariances[o].clone()).collect();
        Self { params, components }
    }
}
