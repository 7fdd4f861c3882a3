//! Core types shared across the pipeline

use crate::error::{LiquidityError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Observation timestamp. Every upstream publishes dated observations,
/// so timestamps have daily resolution.
pub type Timestamp = NaiveDate;

/// Logical series identifier (the configured series name)
pub type SeriesId = String;

/// Raw observation as returned by an upstream source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: Timestamp,
    pub value: f64,
    /// Upstream vintage/revision marker, when the source publishes one
    pub revision: Option<String>,
}

impl Observation {
    /// Create an observation without a revision marker
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self {
            timestamp,
            value,
            revision: None,
        }
    }
}

/// An ingested point. Immutable once written; unique per (series_id, timestamp)
/// in the latest-revision view of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub series_id: SeriesId,
    pub timestamp: Timestamp,
    pub value: f64,
    pub source_revision: String,
}

/// Ordered sequence of points for one series: ascending timestamps, no duplicates
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    id: SeriesId,
    points: Vec<SeriesPoint>,
}

impl Series {
    /// Create an empty series
    pub fn empty(id: impl Into<SeriesId>) -> Self {
        Self {
            id: id.into(),
            points: Vec::new(),
        }
    }

    /// Build a series from points that must already be strictly ascending
    pub fn from_points(id: impl Into<SeriesId>, points: Vec<SeriesPoint>) -> Result<Self> {
        let id = id.into();
        for pair in points.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(LiquidityError::DataQuality {
                    series: id,
                    timestamp: Some(pair[1].timestamp),
                    message: format!(
                        "non-monotonic timestamps ({} follows {})",
                        pair[1].timestamp, pair[0].timestamp
                    ),
                });
            }
        }
        if let Some(foreign) = points.iter().find(|p| p.series_id != id) {
            return Err(LiquidityError::DataError(format!(
                "point for series {} placed in series {}",
                foreign.series_id, id
            )));
        }
        Ok(Self { id, points })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// First timestamp
    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.points.first().map(|p| p.timestamp)
    }

    /// Last timestamp
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.points.last().map(|p| p.timestamp)
    }

    /// Point at an exact timestamp
    pub fn get(&self, timestamp: Timestamp) -> Option<&SeriesPoint> {
        self.points
            .binary_search_by_key(&timestamp, |p| p.timestamp)
            .ok()
            .map(|idx| &self.points[idx])
    }

    /// Latest point at or before `timestamp`
    pub fn as_of(&self, timestamp: Timestamp) -> Option<&SeriesPoint> {
        let idx = self.points.partition_point(|p| p.timestamp <= timestamp);
        if idx == 0 {
            None
        } else {
            Some(&self.points[idx - 1])
        }
    }

    /// (timestamp, value) pairs
    pub fn values(&self) -> impl Iterator<Item = (Timestamp, f64)> + '_ {
        self.points.iter().map(|p| (p.timestamp, p.value))
    }
}

/// A derived value on the reporting calendar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositePoint {
    pub timestamp: Timestamp,
    pub value: f64,
}

/// Derived series with the parameter record that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSeries {
    pub name: String,
    /// Versioned parameters (calendar, units, weighting) that produced the values
    pub parameters: serde_json::Value,
    pub points: Vec<CompositePoint>,
}

impl CompositeSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, timestamp: Timestamp) -> Option<f64> {
        self.points
            .binary_search_by_key(&timestamp, |p| p.timestamp)
            .ok()
            .map(|idx| self.points[idx].value)
    }
}

/// Regime assignment for one timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeLabel {
    pub timestamp: Timestamp,
    /// Hard assignment (argmax posterior for the GMM, Viterbi state for the HMM)
    pub regime: usize,
    /// Posterior probability of every regime
    pub probabilities: Vec<f64>,
}

/// Regime labels produced by one model over the full composite history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeLabelSeries {
    pub model: String,
    pub labels: Vec<RegimeLabel>,
}
