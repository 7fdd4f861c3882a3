//! Alignment onto the reporting calendar
//!
//! Every series is resampled onto the same session grid by carrying the most
//! recent observation at or before each session forward. Nothing is ever
//! back-filled: a session before a series' first observation stays empty.

use crate::calendar::ReportingCalendar;
use crate::error::{LiquidityError, Result};
use crate::types::{Series, Timestamp};

/// One session of an aligned series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedPoint {
    pub timestamp: Timestamp,
    pub value: Option<f64>,
    /// Raw observation the value was taken from
    pub source_timestamp: Option<Timestamp>,
}

impl AlignedPoint {
    /// Whether the value was carried forward from an earlier observation
    pub fn is_filled(&self) -> bool {
        matches!(self.source_timestamp, Some(src) if src != self.timestamp)
    }
}

/// A series resampled onto a session grid
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSeries {
    pub name: String,
    pub points: Vec<AlignedPoint>,
}

impl AlignedSeries {
    /// Build from per-session values on `sessions`
    pub fn from_values(name: impl Into<String>, sessions: &[Timestamp], values: Vec<Option<f64>>) -> Self {
        let points = sessions
            .iter()
            .zip(values)
            .map(|(&timestamp, value)| AlignedPoint {
                timestamp,
                value,
                source_timestamp: value.map(|_| timestamp),
            })
            .collect();
        Self {
            name: name.into(),
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Number of sessions holding a carried-forward value
    pub fn filled_count(&self) -> usize {
        self.points.iter().filter(|p| p.is_filled()).count()
    }
}

/// Calendar sessions spanning `[start, end]`
pub fn session_grid(calendar: &dyn ReportingCalendar, start: Timestamp, end: Timestamp) -> Result<Vec<Timestamp>> {
    if end < start {
        return Err(LiquidityError::DataError(format!(
            "empty alignment window {} .. {}",
            start, end
        )));
    }
    let sessions = calendar.sessions_between(start, end);
    if sessions.is_empty() {
        return Err(LiquidityError::DataError(format!(
            "calendar {} has no sessions between {} and {}",
            calendar.describe(),
            start,
            end
        )));
    }
    Ok(sessions)
}

/// Forward-fill `series` onto `sessions`.
///
/// A session takes the latest observation dated on or before it. With
/// `max_staleness_days`, older carried values are treated as missing.
pub fn forward_fill(series: &Series, sessions: &[Timestamp], max_staleness_days: Option<u32>) -> AlignedSeries {
    let points = sessions
        .iter()
        .map(|&session| {
            let source = series.as_of(session).filter(|p| match max_staleness_days {
                Some(max) => (session - p.timestamp).num_days() <= i64::from(max),
                None => true,
            });
            AlignedPoint {
                timestamp: session,
                value: source.map(|p| p.value),
                source_timestamp: source.map(|p| p.timestamp),
            }
        })
        .collect();

    AlignedSeries {
        name: series.id().to_string(),
        points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::WeeklyCalendar;
    use crate::types::SeriesPoint;
    use chrono::{NaiveDate, Weekday};

    fn d(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn daily(values: &[(NaiveDate, f64)]) -> Series {
        let points = values
            .iter()
            .map(|&(timestamp, value)| SeriesPoint {
                series_id: "RRPONTSYD".to_string(),
                timestamp,
                value,
                source_revision: "r".to_string(),
            })
            .collect();
        Series::from_points("RRPONTSYD", points).unwrap()
    }

    #[test]
    fn test_forward_fill_onto_weekly_grid() {
        let calendar = WeeklyCalendar::new(Weekday::Wed, "v1");
        // Wednesdays: Jan 3, 10, 17
        let sessions = session_grid(&calendar, d(1, 2), d(1, 17)).unwrap();
        assert_eq!(sessions, vec![d(1, 3), d(1, 10), d(1, 17)]);

        let series = daily(&[(d(1, 4), 10.0), (d(1, 9), 11.0), (d(1, 12), 12.0)]);
        let aligned = forward_fill(&series, &sessions, None);

        assert_eq!(aligned.points[0].value, None);
        assert_eq!(aligned.points[1].value, Some(11.0));
        assert_eq!(aligned.points[1].source_timestamp, Some(d(1, 9)));
        assert!(aligned.points[1].is_filled());
        assert_eq!(aligned.points[2].value, Some(12.0));
        assert_eq!(aligned.filled_count(), 2);
    }

    #[test]
    fn test_staleness_bound() {
        let sessions = vec![d(1, 3), d(1, 10), d(1, 17)];
        let series = daily(&[(d(1, 3), 1.0)]);
        let aligned = forward_fill(&series, &sessions, Some(7));
        assert_eq!(aligned.values(), vec![Some(1.0), Some(1.0), None]);
    }

    #[test]
    fn test_empty_window_rejected() {
        let calendar = WeeklyCalendar::new(Weekday::Wed, "v1");
        assert!(session_grid(&calendar, d(1, 10), d(1, 3)).is_err());
        assert!(session_grid(&calendar, d(1, 4), d(1, 5)).is_err());
    }
}
