//! Composite series: Net Liquidity and the Global Liquidity Index

use super::align::AlignedSeries;
use crate::config::Weighting;
use crate::error::{LiquidityError, Result};
use crate::types::CompositePoint;

fn check_aligned(series: &[&AlignedSeries]) -> Result<()> {
    let first = match series.first() {
        Some(s) => s,
        None => return Ok(()),
    };
    for other in &series[1..] {
        let same_grid = other.len() == first.len()
            && other
                .points
                .iter()
                .zip(&first.points)
                .all(|(a, b)| a.timestamp == b.timestamp);
        if !same_grid {
            return Err(LiquidityError::DataError(format!(
                "{} and {} are not aligned on the same calendar",
                first.name, other.name
            )));
        }
    }
    Ok(())
}

/// `assets - reverse_repo - treasury_account` at every session where all
/// three inputs have a value. Sessions missing any input are left out.
pub fn net_liquidity(
    assets: &AlignedSeries,
    reverse_repo: &AlignedSeries,
    treasury_account: &AlignedSeries,
) -> Result<Vec<CompositePoint>> {
    check_aligned(&[assets, reverse_repo, treasury_account])?;

    let points = assets
        .points
        .iter()
        .zip(&reverse_repo.points)
        .zip(&treasury_account.points)
        .filter_map(|((a, b), c)| match (a.value, b.value, c.value) {
            (Some(a_val), Some(b_val), Some(c_val)) => Some(CompositePoint {
                timestamp: a.timestamp,
                value: a_val - b_val - c_val,
            }),
            _ => None,
        })
        .collect();
    Ok(points)
}

/// Weight applied to each region under a weighting scheme
pub fn region_weights(region_names: &[&str], weighting: &Weighting) -> Result<Vec<f64>> {
    if region_names.is_empty() {
        return Err(LiquidityError::ConfigError("weighted index has no regions".to_string()));
    }
    match weighting {
        Weighting::Sum => Ok(vec![1.0; region_names.len()]),
        Weighting::Equal => Ok(vec![1.0 / region_names.len() as f64; region_names.len()]),
        Weighting::Fixed { weights } => region_names
            .iter()
            .map(|name| {
                weights.get(*name).copied().ok_or_else(|| {
                    LiquidityError::ConfigError(format!("no weight for region '{}'", name))
                })
            })
            .collect(),
    }
}

/// Weighted sum of regional series at every session where all regions have
/// a value.
pub fn weighted_index(regions: &[(&str, &AlignedSeries)], weighting: &Weighting) -> Result<Vec<CompositePoint>> {
    let names: Vec<&str> = regions.iter().map(|(name, _)| *name).collect();
    let weights = region_weights(&names, weighting)?;
    let series: Vec<&AlignedSeries> = regions.iter().map(|(_, s)| *s).collect();
    check_aligned(&series)?;

    let sessions = series[0].len();
    let mut points = Vec::new();
    'session: for idx in 0..sessions {
        let mut total = 0.0;
        for (s, weight) in series.iter().zip(&weights) {
            match s.points[idx].value {
                Some(v) => total += weight * v,
                None => continue 'session,
            }
        }
        points.push(CompositePoint {
            timestamp: series[0].points[idx].timestamp,
            value: total,
        });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn sessions() -> Vec<NaiveDate> {
        (0..4)
            .map(|w| NaiveDate::from_ymd_opt(2024, 1, 3).unwrap() + chrono::Duration::weeks(w))
            .collect()
    }

    #[test]
    fn test_net_liquidity_skips_incomplete_sessions() {
        let s = sessions();
        let a = AlignedSeries::from_values("a", &s, vec![Some(100.0), Some(110.0), Some(120.0), None]);
        let b = AlignedSeries::from_values("b", &s, vec![None, Some(10.0), Some(12.0), Some(13.0)]);
        let c = AlignedSeries::from_values("c", &s, vec![Some(5.0), Some(6.0), Some(7.0), Some(8.0)]);

        let nl = net_liquidity(&a, &b, &c).unwrap();
        assert_eq!(nl.len(), 2);
        assert_eq!(nl[0].timestamp, s[1]);
        assert_relative_eq!(nl[0].value, 94.0);
        assert_relative_eq!(nl[1].value, 101.0);
    }

    #[test]
    fn test_misaligned_inputs_rejected() {
        let s = sessions();
        let a = AlignedSeries::from_values("a", &s, vec![Some(1.0); 4]);
        let b = AlignedSeries::from_values("b", &s[1..], vec![Some(1.0); 3]);
        assert!(net_liquidity(&a, &b, &a).is_err());
    }

    #[test]
    fn test_weighting_schemes() {
        let s = sessions();
        let us = AlignedSeries::from_values("us", &s, vec![Some(10.0), Some(20.0), None, Some(40.0)]);
        let ea = AlignedSeries::from_values("ea", &s, vec![Some(2.0), Some(4.0), Some(6.0), Some(8.0)]);
        let regions = [("us", &us), ("ea", &ea)];

        let sum = weighted_index(&regions, &Weighting::Sum).unwrap();
        assert_eq!(sum.len(), 3);
        assert_relative_eq!(sum[0].value, 12.0);

        let equal = weighted_index(&regions, &Weighting::Equal).unwrap();
        assert_relative_eq!(equal[1].value, 12.0);

        let mut weights = BTreeMap::new();
        weights.insert("us".to_string(), 0.75);
        weights.insert("ea".to_string(), 0.25);
        let fixed = weighted_index(&regions, &Weighting::Fixed { weights }).unwrap();
        assert_relative_eq!(fixed[2].value, 0.75 * 40.0 + 0.25 * 8.0);
    }
}
