//! End-to-end update cycles against an on-disk store

mod common;

use approx::assert_relative_eq;
use liquidity_regimes::config::NET_LIQUIDITY;
use liquidity_regimes::data::{IngestStatus, SeriesStore};
use liquidity_regimes::error::LiquidityError;
use liquidity_regimes::pipeline::{CycleLock, CycleMode, Stage, UpdateOrchestrator};
use tempfile::TempDir;

fn cold_start(dir: &TempDir, source: &std::sync::Arc<liquidity_regimes::data::InMemorySource>) -> String {
    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(source)).unwrap();
    orchestrator.run_cycle(CycleMode::ColdStart).unwrap();
    orchestrator.store().content_digest().unwrap()
}

#[test]
fn test_cold_start_commits_everything() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();

    let report = orchestrator.run_cycle(CycleMode::ColdStart).unwrap();
    assert_eq!(report.series.len(), 4);
    for series in &report.series {
        assert_eq!(series.status, IngestStatus::Ok);
        assert_eq!(series.rows_added, common::WEEKS);
        assert_eq!(series.cursor, Some(common::week(common::WEEKS - 1)));
    }
    assert_eq!(report.composites, vec![(NET_LIQUIDITY.to_string(), common::WEEKS)]);
    assert!(report.observations_fitted > 100);

    let store = orchestrator.store();
    let ledger = store.ledger();
    assert_eq!(ledger.get_cursor("fed_assets").unwrap(), Some(common::week(common::WEEKS - 1)));
    assert_eq!(store.load_series("tga").unwrap().len(), common::WEEKS);

    let hmm = store.load_labels("hmm").unwrap().unwrap();
    assert_eq!(hmm.labels.len(), report.observations_fitted);
    assert!(store.load_labels("gmm").unwrap().is_some());
    assert!(store.latest_artifact("hmm").unwrap().is_some());

    let cycles = ledger.recent_cycles(5).unwrap();
    assert_eq!(cycles[0].outcome, "committed");
    assert_eq!(cycles[0].mode, "cold_start");
    assert_eq!(ledger.ingest_log(&report.cycle_id).unwrap().len(), 4);
}

#[test]
fn test_update_without_new_data_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    let before = cold_start(&dir, &source);

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let report = orchestrator.run_cycle(CycleMode::Incremental).unwrap();
    assert!(report.series.iter().all(|s| s.status == IngestStatus::NoNewData));
    assert_eq!(report.commit.points_written, 0);
    assert_eq!(report.commit.cursors_advanced, 0);

    // Second run: same store contents, same cursors
    let report = orchestrator.run_cycle(CycleMode::Incremental).unwrap();
    assert_eq!(report.commit.points_written, 0);
    assert_eq!(orchestrator.store().content_digest().unwrap(), before);
}

#[test]
fn test_cold_start_rerun_keeps_store_identical() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    let before = cold_start(&dir, &source);
    let after = cold_start(&dir, &source);
    assert_eq!(before, after);
}

#[test]
fn test_incremental_cycle_appends_new_week() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    cold_start(&dir, &source);

    for id in common::UPSTREAM_IDS {
        source.publish(id, common::synthetic(id, common::WEEKS..common::WEEKS + 1));
    }

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let report = orchestrator.run_cycle(CycleMode::Incremental).unwrap();
    for series in &report.series {
        assert_eq!(series.status, IngestStatus::Ok);
        assert_eq!(series.rows_added, 1);
        assert_eq!(series.rows_total, common::WEEKS + 1);
    }
    assert_eq!(report.commit.cursors_advanced, 4);
    assert_eq!(
        orchestrator.store().ledger().get_cursor("reverse_repo").unwrap(),
        Some(common::week(common::WEEKS))
    );
    // Composites are recomputed over the full history
    let nl = orchestrator.store().load_composite(NET_LIQUIDITY).unwrap().unwrap();
    assert_eq!(nl.len(), common::WEEKS + 1);
}

#[test]
fn test_revised_point_is_a_logged_conflict() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    cold_start(&dir, &source);
    let before = {
        let config = common::config(dir.path());
        let store = SeriesStore::open(&config.store_path()).unwrap();
        store.load_composite(NET_LIQUIDITY).unwrap().unwrap()
    };

    // Upstream revises an interior week of the TGA by 1,000 (millions)
    let revised_week = 80;
    let mut history = common::synthetic("WTREGEN", 0..common::WEEKS);
    history[revised_week].value += 1_000.0;
    let revised_value = history[revised_week].value;
    source.set_series("WTREGEN", history);

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    // Cold start re-reads the full history, so the revision is seen
    let report = orchestrator.run_cycle(CycleMode::ColdStart).unwrap();
    let tga = report.series.iter().find(|s| s.series_id == "tga").unwrap();
    assert_eq!(tga.conflicts, 1);
    assert_eq!(tga.rows_added, 0);

    let store = orchestrator.store();
    assert_eq!(store.revision_count("tga").unwrap(), common::WEEKS + 1);
    let latest = store.load_series("tga").unwrap();
    assert_eq!(latest.len(), common::WEEKS);
    assert_eq!(latest.points()[revised_week].value, revised_value);

    // The correction reaches the recomputed composite, in billions
    let after = store.load_composite(NET_LIQUIDITY).unwrap().unwrap();
    assert_eq!(after.len(), before.len());
    let at = common::week(revised_week);
    assert_relative_eq!(after.get(at).unwrap(), before.get(at).unwrap() - 1.0, epsilon = 1e-9);
    for (old, new) in before.points.iter().zip(&after.points) {
        assert_eq!(old.timestamp, new.timestamp);
        if old.timestamp != at {
            assert_relative_eq!(old.value, new.value, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_retrain_failure_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    let before = cold_start(&dir, &source);
    for id in common::UPSTREAM_IDS {
        source.publish(id, common::synthetic(id, common::WEEKS..common::WEEKS + 2));
    }

    // More regimes than distinct observations: RETRAIN must fail
    let mut config = common::config(dir.path());
    config.model.n_regimes = 10_000;
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let err = orchestrator.run_cycle(CycleMode::Incremental).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Retrain));
    assert!(err.to_string().contains("RETRAIN"));

    let store = orchestrator.store();
    assert_eq!(store.content_digest().unwrap(), before);
    assert_eq!(
        store.ledger().get_cursor("fed_assets").unwrap(),
        Some(common::week(common::WEEKS - 1))
    );
    let cycles = store.ledger().recent_cycles(1).unwrap();
    assert_eq!(cycles[0].outcome, "failed");
    assert_eq!(cycles[0].failed_stage.as_deref(), Some("RETRAIN"));

    // The staged weeks are picked up by the next healthy cycle
    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let report = orchestrator.run_cycle(CycleMode::Incremental).unwrap();
    assert!(report.series.iter().all(|s| s.rows_added == 2));
}

#[test]
fn test_critical_series_failure_aborts_in_fetch() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    source.fail_permanently("WALCL");

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let err = orchestrator.run_cycle(CycleMode::ColdStart).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Fetch));
    assert_eq!(err.series(), Some("fed_assets"));
    assert_eq!(err.exit_code(), 1);
    // Permanent failures are not retried
    assert_eq!(source.call_count("WALCL"), 1);

    let store = orchestrator.store();
    assert_eq!(store.load_series("tga").unwrap().len(), 0);
    assert!(store.ledger().entries().unwrap().is_empty());
}

#[test]
fn test_malformed_critical_value_fails_transform_as_data_quality() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    let mut observations = common::synthetic("WALCL", 0..common::WEEKS);
    observations[5].value = f64::NAN;
    source.set_series("WALCL", observations);

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let err = orchestrator.run_cycle(CycleMode::ColdStart).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Transform));
    assert_eq!(err.series(), Some("fed_assets"));
    assert!(!err.is_upstream());
    match err.root() {
        LiquidityError::DataQuality { series, timestamp, .. } => {
            assert_eq!(series, "fed_assets");
            assert_eq!(*timestamp, Some(common::week(5)));
        }
        other => panic!("expected a data quality error, got {}", other),
    }
    // Invalid data is not retried
    assert_eq!(source.call_count("WALCL"), 1);

    let store = orchestrator.store();
    assert!(store.ledger().entries().unwrap().is_empty());
    let cycles = store.ledger().recent_cycles(1).unwrap();
    assert_eq!(cycles[0].failed_stage.as_deref(), Some("CLEAN/TRANSFORM"));
}

#[test]
fn test_malformed_non_critical_value_is_not_degraded() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    let mut observations = common::synthetic("WRESBAL", 0..common::WEEKS);
    observations.swap(10, 11);
    source.set_series("WRESBAL", observations);

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let err = orchestrator.run_cycle(CycleMode::ColdStart).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Transform));
    assert_eq!(err.series(), Some("bank_reserves"));
    assert!(matches!(err.root(), LiquidityError::DataQuality { .. }));
    assert_eq!(orchestrator.store().load_series("fed_assets").unwrap().len(), 0);
}

#[test]
fn test_non_critical_failure_is_degraded() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    source.fail_permanently("WRESBAL");

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let report = orchestrator.run_cycle(CycleMode::ColdStart).unwrap();
    assert_eq!(report.degraded(), vec!["bank_reserves"]);
    assert_eq!(orchestrator.store().ledger().get_cursor("bank_reserves").unwrap(), None);
    assert!(orchestrator.store().ledger().get_cursor("fed_assets").unwrap().is_some());

    let log = orchestrator.store().ledger().ingest_log(&report.cycle_id).unwrap();
    let reserves = log.iter().find(|e| e.series_id == "bank_reserves").unwrap();
    assert_eq!(reserves.status, IngestStatus::Degraded);
    assert!(reserves.detail.is_some());
}

#[test]
fn test_transient_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    source.fail_transiently("RRPONTSYD", 2);

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let report = orchestrator.run_cycle(CycleMode::ColdStart).unwrap();
    assert!(report.degraded().is_empty());
    assert_eq!(source.call_count("RRPONTSYD"), 3);
    assert_eq!(source.call_count("WALCL"), 1);
}

#[test]
fn test_transient_failures_exhaust_retries() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    source.fail_transiently("WTREGEN", 10);

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let err = orchestrator.run_cycle(CycleMode::ColdStart).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Fetch));
    // max_retries = 2
    assert_eq!(source.call_count("WTREGEN"), 3);
}

#[test]
fn test_concurrent_cycle_fails_fast() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    let config = common::config(dir.path());
    let _held = CycleLock::acquire(&config.lock_path()).unwrap();

    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let err = orchestrator.run_cycle(CycleMode::Incremental).unwrap_err();
    assert!(matches!(err, LiquidityError::CycleInProgress(_)));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(source.call_count("WALCL"), 0);
}

#[test]
fn test_cursor_ahead_of_store_is_refused() {
    let dir = TempDir::new().unwrap();
    let source = common::source(common::WEEKS);
    cold_start(&dir, &source);

    {
        let config = common::config(dir.path());
        let store = SeriesStore::open(&config.store_path()).unwrap();
        store
            .ledger()
            .record("tga", common::week(common::WEEKS + 10), "manual")
            .unwrap();
    }

    let config = common::config(dir.path());
    let mut orchestrator = UpdateOrchestrator::open(config, common::registry(&source)).unwrap();
    let err = orchestrator.run_cycle(CycleMode::Incremental).unwrap_err();
    assert!(matches!(err, LiquidityError::Consistency { .. }));
    assert_eq!(err.exit_code(), 2);
}
