//! Merge staged points into the committed history
//!
//! Deduplicates by (series, timestamp). A staged point equal to the stored
//! one is dropped; a differing value is a conflict that wins and is logged.

use crate::error::{LiquidityError, Result};
use crate::types::{Series, SeriesPoint, Timestamp};
use log::{debug, warn};
use std::collections::BTreeMap;

/// A changed value for an already stored timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub timestamp: Timestamp,
    pub stored: f64,
    pub incoming: f64,
}

/// Result of merging one series
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Latest-revision view after the merge
    pub series: Series,
    /// Points that must be appended to the store
    pub new_points: Vec<SeriesPoint>,
    pub duplicates: usize,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    /// Points appended at timestamps the store had never seen
    pub fn rows_added(&self) -> usize {
        self.new_points.len() - self.conflicts.len()
    }
}

/// Merge staged points for one series into its committed history
pub fn merge_staged(committed: &Series, staged: &[SeriesPoint]) -> Result<MergeOutcome> {
    let series_id = committed.id().to_string();

    // Later staged points for the same timestamp replace earlier ones
    let mut incoming: BTreeMap<Timestamp, &SeriesPoint> = BTreeMap::new();
    for point in staged {
        if point.series_id != series_id {
            return Err(LiquidityError::DataError(format!(
                "staged point for {} merged into {}",
                point.series_id, series_id
            )));
        }
        if !point.value.is_finite() {
            return Err(LiquidityError::DataQuality {
                series: series_id,
                timestamp: Some(point.timestamp),
                message: format!("non-finite value {}", point.value),
            });
        }
        incoming.insert(point.timestamp, point);
    }

    let mut merged: BTreeMap<Timestamp, SeriesPoint> = committed
        .points()
        .iter()
        .map(|p| (p.timestamp, p.clone()))
        .collect();

    let mut new_points = Vec::new();
    let mut conflicts = Vec::new();
    let mut duplicates = 0;

    for (timestamp, point) in incoming {
        match merged.get(&timestamp) {
            Some(existing) if existing.value.to_bits() == point.value.to_bits() => {
                duplicates += 1;
            }
            Some(existing) => {
                warn!(
                    "Conflict in {} at {}: stored {} replaced by {}",
                    series_id, timestamp, existing.value, point.value
                );
                conflicts.push(Conflict {
                    timestamp,
                    stored: existing.value,
                    incoming: point.value,
                });
                new_points.push(point.clone());
                merged.insert(timestamp, point.clone());
            }
            None => {
                new_points.push(point.clone());
                merged.insert(timestamp, point.clone());
            }
        }
    }

    if duplicates > 0 {
        debug!("{}: dropped {} duplicate points", series_id, duplicates);
    }

    let series = Series::from_points(series_id, merged.into_values().collect())?;
    Ok(MergeOutcome {
        series,
        new_points,
        duplicates,
        conflicts,
    })
}
