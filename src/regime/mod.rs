//! Regime inference engine
//!
//! Fits a static Gaussian mixture and a Gaussian HMM over the feature
//! matrix, refitting from scratch every cycle. Component indices are
//! arbitrary after a fit, so both models are re-ordered before their labels
//! leave the engine:
//!
//! - `ranked`: regime 0 has the highest mean over the ordering features
//!   (the most expansive liquidity regime), the last regime the lowest.
//! - `previous_fit`: each regime takes the index of the nearest centroid of
//!   the previous committed fit; without a comparable previous fit the
//!   ranking rule applies.

pub mod gmm;
pub mod hmm;
pub mod init;
pub mod labels;
pub mod linalg;

pub use gmm::{GaussianMixture, GmmFit, GmmParams};
pub use hmm::{GaussianHmm, HmmFit, HmmParams};

use crate::config::{LabelAlignment, ModelConfig};
use crate::data::store::ModelArtifact;
use crate::error::{LiquidityError, Result};
use crate::transform::FeatureMatrix;
use crate::types::{RegimeLabel, RegimeLabelSeries};
use log::{info, warn};
use ndarray::{Array2, Axis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Fail unless `data` holds at least `components` distinct rows
pub(crate) fn check_sample_size(model: &str, data: &Array2<f64>, components: usize) -> Result<()> {
    let mut rows: Vec<Vec<u64>> = data
        .axis_iter(Axis(0))
        .map(|r| r.iter().map(|v| v.to_bits()).collect())
        .collect();
    rows.sort();
    rows.dedup();
    if components == 0 || rows.len() < components {
        return Err(LiquidityError::InsufficientData {
            model: model.to_string(),
            observations: rows.len(),
            components,
        });
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(LiquidityError::ModelFit {
            model: model.to_string(),
            message: "feature matrix contains non-finite values".to_string(),
        });
    }
    Ok(())
}

/// Index of the largest entry of every row, lowest index on ties
pub(crate) fn argmax_rows(table: &Array2<f64>) -> Vec<usize> {
    table
        .axis_iter(Axis(0))
        .map(|row| {
            let mut best = 0;
            for (idx, v) in row.iter().enumerate() {
                if *v > row[best] {
                    best = idx;
                }
            }
            best
        })
        .collect()
}

/// Component means of a fitted model, used to align regime indices
pub trait RegimeMeans {
    fn means(&self) -> &[Vec<f64>];
}

impl RegimeMeans for GmmParams {
    fn means(&self) -> &[Vec<f64>] {
        &self.means
    }
}

impl RegimeMeans for HmmParams {
    fn means(&self) -> &[Vec<f64>] {
        &self.means
    }
}

/// Undo a column standardisation: `m * scale + mean` per column
fn to_raw_units(means: &[Vec<f64>], offsets: &[f64], scales: &[f64]) -> Option<Vec<Vec<f64>>> {
    if offsets.len() != scales.len() {
        return None;
    }
    means
        .iter()
        .map(|row| {
            if row.len() != scales.len() {
                return None;
            }
            Some(
                row.iter()
                    .zip(offsets.iter().zip(scales))
                    .map(|(m, (mean, scale))| m * scale + mean)
                    .collect(),
            )
        })
        .collect()
}

/// Nearest-centroid matching against a previous fit. Each fit's means live
/// in the standardisation of its own cycle, so both are compared in raw
/// feature units.
fn match_in_raw_units<P: RegimeMeans>(
    means: &[Vec<f64>],
    features: &FeatureMatrix,
    previous: &FittedModel<P>,
) -> Option<Vec<usize>> {
    let current = to_raw_units(means, &features.column_means, &features.column_scales)?;
    let prior = to_raw_units(previous.params.means(), &previous.feature_means, &previous.feature_scales)?;
    labels::match_previous(&current, &prior)
}

/// Persisted model parameters together with the feature space they live in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel<P> {
    pub columns: Vec<String>,
    pub feature_means: Vec<f64>,
    pub feature_scales: Vec<f64>,
    pub ordering_features: Vec<String>,
    pub alignment: LabelAlignment,
    pub params: P,
}

impl<P: Serialize + DeserializeOwned> FittedModel<P> {
    pub fn to_artifact(&self, model: &str) -> Result<ModelArtifact> {
        Ok(ModelArtifact {
            model: model.to_string(),
            params: serde_json::to_value(self)?,
        })
    }

    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self> {
        Ok(serde_json::from_value(artifact.params.clone())?)
    }
}

/// Output of one model: aligned fit plus its labels
#[derive(Debug, Clone)]
pub struct ModelOutput<P> {
    pub fitted: FittedModel<P>,
    pub labels: RegimeLabelSeries,
}

/// Output of both models for one cycle
#[derive(Debug, Clone)]
pub struct RegimeOutput {
    pub gmm: ModelOutput<GmmParams>,
    pub hmm: ModelOutput<HmmParams>,
}

impl RegimeOutput {
    pub fn artifacts(&self) -> Result<Vec<ModelArtifact>> {
        Ok(vec![
            self.gmm.fitted.to_artifact(gmm::MODEL_NAME)?,
            self.hmm.fitted.to_artifact(hmm::MODEL_NAME)?,
        ])
    }

    pub fn labels(&self) -> Vec<RegimeLabelSeries> {
        vec![self.gmm.labels.clone(), self.hmm.labels.clone()]
    }
}

/// Previously committed fits used for `previous_fit` alignment
#[derive(Debug, Clone, Default)]
pub struct PreviousFits {
    pub gmm: Option<FittedModel<GmmParams>>,
    pub hmm: Option<FittedModel<HmmParams>>,
}

/// Regime inference engine
pub struct RegimeEngine<'a> {
    config: &'a ModelConfig,
}

impl<'a> RegimeEngine<'a> {
    pub fn new(config: &'a ModelConfig) -> Self {
        Self { config }
    }

    /// Column indices whose means rank regimes
    fn ordering_columns(&self, features: &FeatureMatrix) -> Result<(Vec<String>, Vec<usize>)> {
        let names = if self.config.ordering_features.is_empty() {
            features.level_columns()
        } else {
            self.config.ordering_features.clone()
        };
        let mut indices = Vec::with_capacity(names.len());
        for name in &names {
            let idx = features.column_index(name).ok_or_else(|| {
                LiquidityError::ConfigError(format!("ordering feature '{}' is not a feature column", name))
            })?;
            indices.push(idx);
        }
        Ok((names, indices))
    }

    /// Canonical ordering for a fit with the given means
    fn alignment_order<P: RegimeMeans>(
        &self,
        model: &str,
        means: &[Vec<f64>],
        ordering: &[usize],
        features: &FeatureMatrix,
        previous: Option<&FittedModel<P>>,
    ) -> Vec<usize> {
        if self.config.alignment == LabelAlignment::PreviousFit {
            match previous {
                Some(prev) if prev.columns == features.columns => {
                    if let Some(order) = match_in_raw_units(means, features, prev) {
                        return order;
                    }
                    warn!("{}: previous fit not comparable; ranking regimes instead", model);
                }
                Some(_) => warn!("{}: feature columns changed since the previous fit; ranking regimes instead", model),
                None => info!("{}: no previous fit; ranking regimes", model),
            }
        }
        labels::rank_by_expansiveness(means, ordering)
    }

    fn fitted<P>(&self, features: &FeatureMatrix, ordering_features: &[String], params: P) -> FittedModel<P> {
        FittedModel {
            columns: features.columns.clone(),
            feature_means: features.column_means.clone(),
            feature_scales: features.column_scales.clone(),
            ordering_features: ordering_features.to_vec(),
            alignment: self.config.alignment,
            params,
        }
    }

    fn label_series(model: &str, features: &FeatureMatrix, regimes: Vec<usize>, probabilities: &Array2<f64>) -> RegimeLabelSeries {
        let labels = features
            .timestamps
            .iter()
            .zip(regimes)
            .zip(probabilities.axis_iter(Axis(0)))
            .map(|((&timestamp, regime), probs)| RegimeLabel {
                timestamp,
                regime,
                probabilities: probs.to_vec(),
            })
            .collect();
        RegimeLabelSeries {
            model: model.to_string(),
            labels,
        }
    }

    /// Fit the Gaussian mixture and label every row by arg-max responsibility
    pub fn fit_gmm(&self, features: &FeatureMatrix, previous: Option<&FittedModel<GmmParams>>) -> Result<ModelOutput<GmmParams>> {
        let (ordering_names, ordering) = self.ordering_columns(features)?;
        let estimator = GaussianMixture::new(
            self.config.n_regimes,
            self.config.seed,
            self.config.gmm.clone(),
            self.config.singular_tolerance,
        );
        let raw = estimator.fit(&features.data)?;
        let order = self.alignment_order(
            gmm::MODEL_NAME,
            &raw.params().means,
            &ordering,
            features,
            previous,
        );
        let fit = raw.permuted(&order);

        let responsibilities = fit.responsibilities(&features.data);
        let regimes = argmax_rows(&responsibilities);
        let labels = Self::label_series(gmm::MODEL_NAME, features, regimes, &responsibilities);
        Ok(ModelOutput {
            fitted: self.fitted(features, &ordering_names, fit.params().clone()),
            labels,
        })
    }

    /// Fit the HMM and label every row by its Viterbi state
    pub fn fit_hmm(&self, features: &FeatureMatrix, previous: Option<&FittedModel<HmmParams>>) -> Result<ModelOutput<HmmParams>> {
        let (ordering_names, ordering) = self.ordering_columns(features)?;
        let estimator = GaussianHmm::new(
            self.config.n_regimes,
            self.config.seed,
            self.config.hmm.clone(),
            self.config.singular_tolerance,
        );
        let raw = estimator.fit(&features.data)?;
        let order = self.alignment_order(
            hmm::MODEL_NAME,
            &raw.params().means,
            &ordering,
            features,
            previous,
        );
        let fit = raw.permuted(&order);
        hmm::validate_transition(fit.transition())?;

        let posteriors = fit.posteriors(&features.data);
        let path = fit.viterbi(&features.data);
        let labels = Self::label_series(hmm::MODEL_NAME, features, path, &posteriors);
        Ok(ModelOutput {
            fitted: self.fitted(features, &ordering_names, fit.params().clone()),
            labels,
        })
    }

    /// Fit both models over the full feature history
    pub fn run(&self, features: &FeatureMatrix, previous: &PreviousFits) -> Result<RegimeOutput> {
        info!(
            "Fitting regimes on {} observations x {} features (K={})",
            features.n_rows(),
            features.n_features(),
            self.config.n_regimes
        );
        let gmm = self.fit_gmm(features, previous.gmm.as_ref())?;
        let hmm = self.fit_hmm(features, previous.hmm.as_ref())?;
        Ok(RegimeOutput { gmm, hmm })
    }
}
