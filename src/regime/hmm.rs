//! Gaussian hidden Markov model
//!
//! Baum-Welch estimation with scaled forward-backward recursions, Viterbi
//! decoding in log space, and best-of-N seeded restarts. After fitting,
//! the transition matrix is smoothed with a pseudo-count and renormalised.

use super::init::kmeans;
use super::linalg::{from_nested, sample_covariance, to_nested, weighted_covariance, weighted_mean, Gaussian};
use crate::config::{CovarianceType, HmmConfig, InitialDistribution};
use crate::error::{LiquidityError, Result};
use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

pub const MODEL_NAME: &str = "hmm";

/// Row sums of a valid transition matrix must be within this of 1
pub const STOCHASTIC_TOLERANCE: f64 = 1e-8;

/// Persistable parameters of a fitted HMM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmmParams {
    pub covariance_type: CovarianceType,
    pub initial_distribution: InitialDistribution,
    pub initial: Vec<f64>,
    /// Row-stochastic: `transition[i][j]` = P(state j at t+1 | state i at t)
    pub transition: Vec<Vec<f64>>,
    pub means: Vec<Vec<f64>>,
    pub covariances: Vec<Vec<Vec<f64>>>,
    /// Total log-likelihood of the training sequence
    pub log_likelihood: f64,
    pub n_iter: usize,
    pub converged: bool,
    /// Seed of the winning restart
    pub seed: u64,
    /// Expected regime duration in periods, `1 / (1 - A_ii)`; `None` for an absorbing state
    pub expected_durations: Vec<Option<f64>>,
}

/// Fitted HMM ready to decode sequences
#[derive(Debug, Clone)]
pub struct HmmFit {
    params: HmmParams,
    transition: Array2<f64>,
    initial: Array1<f64>,
    emissions: Vec<Gaussian>,
}

/// Forward-backward output
struct Posteriors {
    gamma: Array2<f64>,
    /// Expected transition counts summed over time
    xi_sum: Array2<f64>,
    log_likelihood: f64,
}

/// Gaussian HMM estimator
#[derive(Debug, Clone)]
pub struct GaussianHmm {
    n_states: usize,
    seed: u64,
    config: HmmConfig,
    singular_tolerance: f64,
}

impl GaussianHmm {
    pub fn new(n_states: usize, seed: u64, config: HmmConfig, singular_tolerance: f64) -> Self {
        Self {
            n_states,
            seed,
            config,
            singular_tolerance,
        }
    }

    /// Fit by Baum-Welch, keeping the best of `n_tries` seeded restarts.
    ///
    /// Restart `i` uses seed `seed + i`; ties keep the earliest restart. The
    /// winning transition matrix is smoothed before it is returned.
    pub fn fit(&self, data: &Array2<f64>) -> Result<HmmFit> {
        super::check_sample_size(MODEL_NAME, data, self.n_states)?;

        let mut best: Option<HmmFit> = None;
        for attempt in 0..self.config.n_tries {
            let seed = self.seed.wrapping_add(attempt as u64);
            let fit = self.fit_once(data, seed)?;
            debug!(
                "HMM restart seed={} log-likelihood={:.6} iterations={}",
                seed, fit.params.log_likelihood, fit.params.n_iter
            );
            let better = best
                .as_ref()
                .map_or(true, |b| fit.params.log_likelihood > b.params.log_likelihood);
            if better {
                best = Some(fit);
            }
        }

        let mut best = best.ok_or_else(|| LiquidityError::ModelFit {
            model: MODEL_NAME.to_string(),
            message: "no restarts configured".to_string(),
        })?;

        if self.config.transition_smoothing > 0.0 {
            best.smooth_transitions(self.config.transition_smoothing);
        }
        best.params.log_likelihood = best.forward_backward(data).log_likelihood;
        validate_transition(&best.transition)?;

        info!(
            "HMM fitted: K={} seed={} log-likelihood={:.6} iterations={} converged={}",
            self.n_states,
            best.params.seed,
            best.params.log_likelihood,
            best.params.n_iter,
            best.params.converged
        );
        Ok(best)
    }

    fn fit_once(&self, data: &Array2<f64>, seed: u64) -> Result<HmmFit> {
        let k = self.n_states;
        let mut rng = StdRng::seed_from_u64(seed);
        let (centroids, _) = kmeans(data, k, 100, &mut rng);
        let pooled = sample_covariance(data, self.config.covariance, self.config.min_covar);

        let mut emissions = Vec::with_capacity(k);
        for (c, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
            emissions.push(self.emission(centroid.to_owned(), pooled.clone(), c)?);
        }
        let mut fit = HmmFit::new(
            self.config.covariance,
            self.config.initial,
            Array1::from_elem(k, 1.0 / k as f64),
            Array2::from_elem((k, k), 1.0 / k as f64),
            emissions,
            seed,
        );

        let mut previous = f64::NEG_INFINITY;
        for iter in 1..=self.config.max_iter {
            let posteriors = fit.forward_backward(data);
            if !posteriors.log_likelihood.is_finite() {
                return Err(LiquidityError::ModelFit {
                    model: MODEL_NAME.to_string(),
                    message: format!("non-finite log-likelihood at iteration {}", iter),
                });
            }
            let improvement = posteriors.log_likelihood - previous;
            previous = posteriors.log_likelihood;

            fit = self.m_step(data, &posteriors, seed)?;
            fit.params.n_iter = iter;
            fit.params.log_likelihood = posteriors.log_likelihood;
            if improvement.abs() < self.config.tol {
                fit.params.converged = true;
                break;
            }
        }

        fit.params.log_likelihood = fit.forward_backward(data).log_likelihood;
        Ok(fit)
    }

    fn emission(&self, mean: Array1<f64>, covariance: Array2<f64>, state: usize) -> Result<Gaussian> {
        Gaussian::new(mean, covariance, self.singular_tolerance).ok_or_else(|| LiquidityError::SingularCovariance {
            model: MODEL_NAME.to_string(),
            component: state,
        })
    }

    fn m_step(&self, data: &Array2<f64>, posteriors: &Posteriors, seed: u64) -> Result<HmmFit> {
        let k = self.n_states;

        let initial = match self.config.initial {
            InitialDistribution::Estimated => normalise(posteriors.gamma.row(0).to_owned()),
            InitialDistribution::Uniform => Array1::from_elem(k, 1.0 / k as f64),
        };

        let mut transition = posteriors.xi_sum.clone();
        for mut row in transition.axis_iter_mut(Axis(0)) {
            let total = row.sum();
            if total > 0.0 {
                row /= total;
            } else {
                row.fill(1.0 / k as f64);
            }
        }

        let mut emissions = Vec::with_capacity(k);
        for state in 0..k {
            let weights = posteriors.gamma.column(state);
            let total = weights.sum() + f64::EPSILON;
            let mean = weighted_mean(data, weights, total);
            let covariance = weighted_covariance(
                data,
                weights,
                total,
                &mean,
                self.config.covariance,
                self.config.min_covar,
            );
            emissions.push(self.emission(mean, covariance, state)?);
        }

        Ok(HmmFit::new(
            self.config.covariance,
            self.config.initial,
            initial,
            transition,
            emissions,
            seed,
        ))
    }
}

fn normalise(mut values: Array1<f64>) -> Array1<f64> {
    let total = values.sum();
    if total > 0.0 {
        values /= total;
    } else {
        let k = values.len() as f64;
        values.fill(1.0 / k);
    }
    values
}

/// Every row sums to 1 and every entry is a probability
pub fn validate_transition(transition: &Array2<f64>) -> Result<()> {
    for (i, row) in transition.axis_iter(Axis(0)).enumerate() {
        if row.iter().any(|p| !(*p >= 0.0) || !p.is_finite()) {
            return Err(LiquidityError::ModelFit {
                model: MODEL_NAME.to_string(),
                message: format!("transition row {} has an invalid probability", i),
            });
        }
        let total = row.sum();
        if (total - 1.0).abs() > STOCHASTIC_TOLERANCE {
            return Err(LiquidityError::ModelFit {
                model: MODEL_NAME.to_string(),
                message: format!("transition row {} sums to {}", i, total),
            });
        }
    }
    Ok(())
}

fn expected_durations(transition: &Array2<f64>) -> Vec<Option<f64>> {
    transition
        .diag()
        .iter()
        .map(|&stay| if stay < 1.0 { Some(1.0 / (1.0 - stay)) } else { None })
        .collect()
}

impl HmmFit {
    fn new(
        covariance_type: CovarianceType,
        initial_distribution: InitialDistribution,
        initial: Array1<f64>,
        transition: Array2<f64>,
        emissions: Vec<Gaussian>,
        seed: u64,
    ) -> Self {
        let params = HmmParams {
            covariance_type,
            initial_distribution,
            initial: initial.to_vec(),
            transition: to_nested(&transition),
            means: emissions.iter().map(|g| g.mean().to_vec()).collect(),
            covariances: emissions.iter().map(|g| to_nested(g.covariance())).collect(),
            log_likelihood: f64::NEG_INFINITY,
            n_iter: 0,
            converged: false,
            seed,
            expected_durations: expected_durations(&transition),
        };
        Self {
            params,
            transition,
            initial,
            emissions,
        }
    }

    /// Rebuild a fit from persisted parameters
    pub fn from_params(params: HmmParams, singular_tolerance: f64) -> Result<Self> {
        let malformed = |what: &str| LiquidityError::ModelFit {
            model: MODEL_NAME.to_string(),
            message: format!("malformed {}", what),
        };
        let transition = from_nested(&params.transition).ok_or_else(|| malformed("transition matrix"))?;
        validate_transition(&transition)?;

        let mut emissions = Vec::with_capacity(params.means.len());
        for (state, (mean, cov)) in params.means.iter().zip(&params.covariances).enumerate() {
            let covariance = from_nested(cov).ok_or_else(|| malformed("covariance"))?;
            let emission = Gaussian::new(Array1::from(mean.clone()), covariance, singular_tolerance)
                .ok_or_else(|| LiquidityError::SingularCovariance {
                    model: MODEL_NAME.to_string(),
                    component: state,
                })?;
            emissions.push(emission);
        }

        Ok(Self {
            initial: Array1::from(params.initial.clone()),
            transition,
            emissions,
            params,
        })
    }

    pub fn params(&self) -> &HmmParams {
        &self.params
    }

    pub fn n_states(&self) -> usize {
        self.emissions.len()
    }

    pub fn transition(&self) -> &Array2<f64> {
        &self.transition
    }

    pub fn initial(&self) -> &Array1<f64> {
        &self.initial
    }

    fn smooth_transitions(&mut self, pseudo_count: f64) {
        self.transition.mapv_inplace(|p| p + pseudo_count);
        for mut row in self.transition.axis_iter_mut(Axis(0)) {
            let total = row.sum();
            row /= total;
        }
        self.params.transition = to_nested(&self.transition);
        self.params.expected_durations = expected_durations(&self.transition);
    }

    fn emission_log_probs(&self, data: &Array2<f64>) -> Array2<f64> {
        let mut log_b = Array2::zeros((data.nrows(), self.n_states()));
        for (t, row) in data.axis_iter(Axis(0)).enumerate() {
            for (state, emission) in self.emissions.iter().enumerate() {
                log_b[[t, state]] = emission.log_pdf(row);
            }
        }
        log_b
    }

    fn forward_backward(&self, data: &Array2<f64>) -> Posteriors {
        let t_len = data.nrows();
        let k = self.n_states();
        let mut gamma = Array2::<f64>::zeros((t_len, k));
        let mut xi_sum = Array2::<f64>::zeros((k, k));
        if t_len == 0 {
            return Posteriors {
                gamma,
                xi_sum,
                log_likelihood: 0.0,
            };
        }

        // Emissions shifted by their per-row maximum so exp() cannot underflow
        let log_b = self.emission_log_probs(data);
        let mut shift = Array1::<f64>::zeros(t_len);
        let mut b = Array2::<f64>::zeros((t_len, k));
        for t in 0..t_len {
            let max = log_b.row(t).iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            shift[t] = max;
            for j in 0..k {
                b[[t, j]] = (log_b[[t, j]] - max).exp();
            }
        }

        let mut alpha = Array2::<f64>::zeros((t_len, k));
        let mut scale = Array1::<f64>::zeros(t_len);
        for j in 0..k {
            alpha[[0, j]] = self.initial[j] * b[[0, j]];
        }
        scale[0] = alpha.row(0).sum();
        if scale[0] > 0.0 {
            let s = scale[0];
            alpha.row_mut(0).mapv_inplace(|v| v / s);
        }

        for t in 1..t_len {
            for j in 0..k {
                let mut sum = 0.0;
                for i in 0..k {
                    sum += alpha[[t - 1, i]] * self.transition[[i, j]];
                }
                alpha[[t, j]] = sum * b[[t, j]];
            }
            scale[t] = alpha.row(t).sum();
            if scale[t] > 0.0 {
                let s = scale[t];
                alpha.row_mut(t).mapv_inplace(|v| v / s);
            }
        }

        let log_likelihood: f64 = scale
            .iter()
            .zip(shift.iter())
            .map(|(s, m)| s.ln() + m)
            .sum();

        let mut beta = Array2::<f64>::zeros((t_len, k));
        beta.row_mut(t_len - 1).fill(1.0);
        for t in (0..t_len - 1).rev() {
            for i in 0..k {
                let mut sum = 0.0;
                for j in 0..k {
                    sum += self.transition[[i, j]] * b[[t + 1, j]] * beta[[t + 1, j]];
                }
                beta[[t, i]] = if scale[t + 1] > 0.0 { sum / scale[t + 1] } else { sum };
            }

            if scale[t + 1] > 0.0 {
                for i in 0..k {
                    for j in 0..k {
                        xi_sum[[i, j]] += alpha[[t, i]] * self.transition[[i, j]] * b[[t + 1, j]] * beta[[t + 1, j]]
                            / scale[t + 1];
                    }
                }
            }
        }

        for t in 0..t_len {
            let mut total = 0.0;
            for j in 0..k {
                gamma[[t, j]] = alpha[[t, j]] * beta[[t, j]];
                total += gamma[[t, j]];
            }
            if total > 0.0 {
                gamma.row_mut(t).mapv_inplace(|v| v / total);
            }
        }

        Posteriors {
            gamma,
            xi_sum,
            log_likelihood,
        }
    }

    /// Posterior probability of every state at every time step
    pub fn posteriors(&self, data: &Array2<f64>) -> Array2<f64> {
        self.forward_backward(data).gamma
    }

    /// Total log-likelihood of `data`
    pub fn score(&self, data: &Array2<f64>) -> f64 {
        self.forward_backward(data).log_likelihood
    }

    /// Most likely state sequence (Viterbi), lowest index on ties
    pub fn viterbi(&self, data: &Array2<f64>) -> Vec<usize> {
        let t_len = data.nrows();
        let k = self.n_states();
        if t_len == 0 {
            return Vec::new();
        }

        let log_b = self.emission_log_probs(data);
        let log_a = self.transition.mapv(f64::ln);
        let mut delta = Array2::from_elem((t_len, k), f64::NEG_INFINITY);
        let mut psi = Array2::<usize>::zeros((t_len, k));

        for j in 0..k {
            delta[[0, j]] = self.initial[j].ln() + log_b[[0, j]];
        }
        for t in 1..t_len {
            for j in 0..k {
                let mut best_val = f64::NEG_INFINITY;
                let mut best_state = 0;
                for i in 0..k {
                    let val = delta[[t - 1, i]] + log_a[[i, j]];
                    if val > best_val {
                        best_val = val;
                        best_state = i;
                    }
                }
                delta[[t, j]] = best_val + log_b[[t, j]];
                psi[[t, j]] = best_state;
            }
        }

        let mut path = vec![0; t_len];
        let mut best_final = f64::NEG_INFINITY;
        for j in 0..k {
            if delta[[t_len - 1, j]] > best_final {
                best_final = delta[[t_len - 1, j]];
                path[t_len - 1] = j;
            }
        }
        for t in (0..t_len - 1).rev() {
            path[t] = psi[[t + 1, path[t + 1]]];
        }
        path
    }

    /// Reorder states so that new index `i` is old index `order[i]`
    pub fn permuted(&self, order: &[usize]) -> Self {
        let k = order.len();
        let initial = Array1::from_shape_fn(k, |i| self.initial[order[i]]);
        let transition = Array2::from_shape_fn((k, k), |(i, j)| self.transition[[order[i], order[j]]]);
        let emissions: Vec<Gaussian> = order.iter().map(|&o| self.emissions[o].clone()).collect();

        let mut fit = HmmFit::new(
            self.params.covariance_type,
            self.params.initial_distribution,
            initial,
            transition,
            emissions,
            self.params.seed,
        );
        fit.params.log_likelihood = self.params.log_likelihood;
        fit.params.n_iter = self.params.n_iter;
        fit.params.converged = self.params.converged;
        fit
    }
}
