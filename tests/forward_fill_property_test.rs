//! Forward-fill never reads the future

use chrono::{Duration, NaiveDate, Weekday};
use liquidity_regimes::calendar::WeeklyCalendar;
use liquidity_regimes::transform::{composite, forward_fill, session_grid, AlignedSeries};
use liquidity_regimes::types::{Series, SeriesPoint};
use proptest::prelude::*;

fn base() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).unwrap()
}

/// Series from sorted, deduplicated day offsets
fn series_from_offsets(name: &str, offsets: &[i64], values: &[f64]) -> Series {
    let points = offsets
        .iter()
        .zip(values)
        .map(|(&offset, &value)| SeriesPoint {
            series_id: name.to_string(),
            timestamp: base() + Duration::days(offset),
            value,
            source_revision: "r".to_string(),
        })
        .collect();
    Series::from_points(name, points).unwrap()
}

fn offsets_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::btree_set(0i64..365, 1..40).prop_map(|set| set.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_no_look_ahead(
        offsets in offsets_strategy(),
        staleness in prop::option::of(0u32..30),
    ) {
        let values: Vec<f64> = offsets.iter().map(|o| *o as f64 * 1.5 + 10.0).collect();
        let series = series_from_offsets("fed_assets", &offsets, &values);
        let calendar = WeeklyCalendar::new(Weekday::Wed, "weekly-wed-v1");
        let sessions = session_grid(&calendar, base(), base() + Duration::days(400)).unwrap();

        let aligned = forward_fill(&series, &sessions, staleness);
        prop_assert_eq!(aligned.len(), sessions.len());
        for point in &aligned.points {
            match (point.value, point.source_timestamp) {
                (Some(value), Some(source)) => {
                    prop_assert!(source <= point.timestamp);
                    // The value is the latest observation at or before the session
                    let expected = series.as_of(point.timestamp).unwrap();
                    prop_assert_eq!(expected.timestamp, source);
                    prop_assert_eq!(expected.value, value);
                    if let Some(max) = staleness {
                        prop_assert!((point.timestamp - source).num_days() <= i64::from(max));
                    }
                }
                (None, None) => {
                    // Empty only before the first observation or when too stale
                    if let Some(latest) = series.as_of(point.timestamp) {
                        let max = staleness.map(i64::from).unwrap_or(i64::MAX);
                        prop_assert!((point.timestamp - latest.timestamp).num_days() > max);
                    }
                }
                _ => prop_assert!(false, "value and source must be set together"),
            }
        }
    }

    #[test]
    fn prop_net_liquidity_only_where_all_inputs_exist(
        a in offsets_strategy(),
        b in offsets_strategy(),
        c in offsets_strategy(),
    ) {
        let calendar = WeeklyCalendar::new(Weekday::Wed, "weekly-wed-v1");
        let sessions = session_grid(&calendar, base(), base() + Duration::days(400)).unwrap();
        let align = |name: &str, offsets: &[i64], scale: f64| -> AlignedSeries {
            let values: Vec<f64> = offsets.iter().map(|o| *o as f64 * scale).collect();
            forward_fill(&series_from_offsets(name, offsets, &values), &sessions, Some(14))
        };
        let assets = align("a", &a, 10.0);
        let repo = align("b", &b, 1.0);
        let tga = align("c", &c, 2.0);

        let points = composite::net_liquidity(&assets, &repo, &tga).unwrap();
        let mut produced = points.iter().map(|p| p.timestamp).peekable();
        for (i, session) in sessions.iter().enumerate() {
            let inputs = (assets.points[i].value, repo.points[i].value, tga.points[i].value);
            match inputs {
                (Some(x), Some(y), Some(z)) => {
                    prop_assert_eq!(produced.next(), Some(*session));
                    let point = points.iter().find(|p| p.timestamp == *session).unwrap();
                    prop_assert!((point.value - (x - y - z)).abs() < 1e-9);
                }
                _ => prop_assert!(produced.peek() != Some(session)),
            }
        }
        prop_assert!(produced.next().is_none());
    }
}
