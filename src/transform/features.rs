//! Model feature matrix
//!
//! For every composite: rolling z-score of the level and of the first
//! difference (population standard deviation). Rows with any missing
//! feature are dropped, then each column is standardised over the full
//! history.

use crate::config::FeatureConfig;
use crate::error::{LiquidityError, Result};
use crate::types::{CompositeSeries, Timestamp};
use ndarray::Array2;
use statrs::statistics::Statistics;

const LEVEL_SUFFIX: &str = "_z";
const DIFF_SUFFIX: &str = "_d1_z";

/// Standardised features, one row per timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub timestamps: Vec<Timestamp>,
    pub columns: Vec<String>,
    /// `timestamps.len() x columns.len()`
    pub data: Array2<f64>,
    /// Column means removed by the global standardisation
    pub column_means: Vec<f64>,
    /// Column scales divided out by the global standardisation
    pub column_scales: Vec<f64>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Level z-score columns (excludes first-difference columns)
    pub fn level_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.ends_with(LEVEL_SUFFIX) && !c.ends_with(DIFF_SUFFIX))
            .cloned()
            .collect()
    }
}

/// Rolling z-score of the last value in each trailing window.
///
/// Missing inputs are skipped inside a window; windows with fewer than
/// `min_periods` values, or with zero variance, yield no value.
pub fn rolling_zscore(values: &[Option<f64>], window: usize, min_periods: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for idx in 0..values.len() {
        let current = match values[idx] {
            Some(v) => v,
            None => {
                out.push(None);
                continue;
            }
        };
        let start = (idx + 1).saturating_sub(window);
        let sample: Vec<f64> = values[start..=idx].iter().flatten().copied().collect();
        if sample.len() < min_periods.max(1) {
            out.push(None);
            continue;
        }
        let mean = sample.iter().mean();
        let std = sample.iter().population_std_dev();
        if !(std > 1e-12) {
            out.push(None);
            continue;
        }
        out.push(Some((current - mean) / std));
    }
    out
}

/// First difference; the first entry has no predecessor
pub fn first_difference(values: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    if !values.is_empty() {
        out.push(None);
    }
    for pair in values.windows(2) {
        out.push(Some(pair[1] - pair[0]));
    }
    out
}

/// Build the feature matrix over the timestamps shared by all composites
pub fn build_features(composites: &[&CompositeSeries], config: &FeatureConfig) -> Result<FeatureMatrix> {
    let first = composites
        .first()
        .ok_or_else(|| LiquidityError::DataError("no composites to build features from".to_string()))?;
    let window = config.zscore_window;
    let min_periods = config.min_periods.unwrap_or(window);

    let timestamps: Vec<Timestamp> = first
        .points
        .iter()
        .map(|p| p.timestamp)
        .filter(|ts| composites[1..].iter().all(|c| c.get(*ts).is_some()))
        .collect();

    let mut columns = Vec::new();
    let mut raw: Vec<Vec<Option<f64>>> = Vec::new();
    for composite in composites {
        let levels: Vec<f64> = timestamps
            .iter()
            .filter_map(|ts| composite.get(*ts))
            .collect();
        let level_input: Vec<Option<f64>> = levels.iter().map(|v| Some(*v)).collect();

        columns.push(format!("{}{}", composite.name, LEVEL_SUFFIX));
        raw.push(rolling_zscore(&level_input, window, min_periods));
        columns.push(format!("{}{}", composite.name, DIFF_SUFFIX));
        raw.push(rolling_zscore(&first_difference(&levels), window, min_periods));
    }

    let complete: Vec<usize> = (0..timestamps.len())
        .filter(|&row| raw.iter().all(|col| col[row].is_some()))
        .collect();

    let n_cols = columns.len();
    let mut data = Array2::zeros((complete.len(), n_cols));
    for (out_row, &row) in complete.iter().enumerate() {
        for (col, values) in raw.iter().enumerate() {
            data[[out_row, col]] = values[row].unwrap_or(0.0);
        }
    }

    let mut column_means = vec![0.0; n_cols];
    let mut column_scales = vec![1.0; n_cols];
    if !complete.is_empty() {
        for col in 0..n_cols {
            let column: Vec<f64> = data.column(col).to_vec();
            let mean = column.iter().mean();
            let std = column.iter().population_std_dev();
            column_means[col] = mean;
            if std > 1e-12 {
                column_scales[col] = std;
            }
            data.column_mut(col)
                .mapv_inplace(|v| (v - column_means[col]) / column_scales[col]);
        }
    }

    Ok(FeatureMatrix {
        timestamps: complete.iter().map(|&row| timestamps[row]).collect(),
        columns,
        data,
        column_means,
        column_scales,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompositePoint;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};

    fn composite(name: &str, values: &[f64], offset_weeks: i64) -> CompositeSeries {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        CompositeSeries {
            name: name.to_string(),
            parameters: serde_json::Value::Null,
            points: values
                .iter()
                .enumerate()
                .map(|(i, &value)| CompositePoint {
                    timestamp: start + Duration::weeks(i as i64 + offset_weeks),
                    value,
                })
                .collect(),
        }
    }

    #[test]
    fn test_rolling_zscore_uses_population_std() {
        let values = vec![Some(1.0), Some(2.0), Some(3.0)];
        let z = rolling_zscore(&values, 3, 3);
        assert_eq!(z[0], None);
        assert_eq!(z[1], None);
        // mean 2, population std sqrt(2/3)
        assert_relative_eq!(z[2].unwrap(), 1.0 / (2.0f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_rolling_zscore_zero_variance_is_missing() {
        let values = vec![Some(5.0); 4];
        assert!(rolling_zscore(&values, 2, 2).iter().all(|v| v.is_none()));
    }

    #[test]
    fn test_first_difference() {
        assert_eq!(first_difference(&[1.0, 4.0, 2.0]), vec![None, Some(3.0), Some(-2.0)]);
        assert!(first_difference(&[]).is_empty());
    }

    #[test]
    fn test_build_features_joins_and_standardises() {
        let values: Vec<f64> = (0..30).map(|i| (i as f64 * 0.7).sin() * 10.0 + i as f64).collect();
        let nl = composite("net_liquidity", &values, 0);
        let gli = composite("global_liquidity_index", &values[2..], 2);
        let config = FeatureConfig {
            zscore_window: 5,
            min_periods: None,
        };

        let features = build_features(&[&nl, &gli], &config).unwrap();
        assert_eq!(features.n_features(), 4);
        assert_eq!(
            features.level_columns(),
            vec!["net_liquidity_z".to_string(), "global_liquidity_index_z".to_string()]
        );
        assert!(features.n_rows() > 0);
        assert!(features.timestamps.windows(2).all(|w| w[0] < w[1]));
        for col in 0..features.n_features() {
            let column = features.data.column(col).to_vec();
            assert_relative_eq!(column.iter().mean(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_short_history_yields_empty_matrix() {
        let nl = composite("net_liquidity", &[1.0, 2.0, 3.0], 0);
        let config = FeatureConfig {
            zscore_window: 52,
            min_periods: None,
        };
        let features = build_features(&[&nl], &config).unwrap();
        assert_eq!(features.n_rows(), 0);
        assert_eq!(features.n_features(), 2);
    }
}
