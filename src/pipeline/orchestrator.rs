//! Update orchestrator
//!
//! Owns every mutation of the store and ledger. One cycle runs
//! `FETCH -> CLEAN/TRANSFORM -> RETRAIN -> COMMIT` under the cycle lock;
//! nothing is written until COMMIT, which applies all outputs in a single
//! transaction. A failed cycle only records its outcome in the cycle log.

use super::lock::CycleLock;
use super::stage::{Stage, StageMachine};
use crate::calendar::{self, ReportingCalendar};
use crate::config::{FetchConfig, PipelineConfig, SeriesConfig};
use crate::data::ledger::{batch_fingerprint, IngestLogEntry, IngestStatus};
use crate::data::sources::{FetchRequest, SourceRegistry};
use crate::data::store::{CommitBatch, CommitSummary, CursorUpdate, SeriesStore};
use crate::error::{LiquidityError, Result};
use crate::regime::{FittedModel, PreviousFits, RegimeEngine, RegimeOutput};
use crate::transform::{self, merge_staged, TransformOutput};
use crate::types::{Observation, Series, SeriesPoint, Timestamp};
use hashbrown::HashMap;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Revision marker for observations whose source publishes none
const UNVERSIONED: &str = "unversioned";

/// How a cycle chooses its fetch bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Ignore cursors and backfill every series from its start date
    ColdStart,
    /// Fetch only observations strictly after each ledger cursor
    Incremental,
}

impl CycleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleMode::ColdStart => "cold_start",
            CycleMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staged result of fetching one series
#[derive(Debug)]
pub struct StagedSeries {
    pub series_id: String,
    pub since: Option<Timestamp>,
    pub points: Vec<SeriesPoint>,
    pub attempts: u32,
    /// Final error once retries are exhausted, or the first non-retryable one
    pub error: Option<LiquidityError>,
}

/// Per-series outcome of a committed cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesReport {
    pub series_id: String,
    pub status: IngestStatus,
    pub rows_added: usize,
    pub rows_total: usize,
    pub conflicts: usize,
    pub cursor: Option<Timestamp>,
    pub detail: Option<String>,
}

/// Summary of a committed cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: String,
    pub mode: CycleMode,
    pub series: Vec<SeriesReport>,
    /// (composite name, points)
    pub composites: Vec<(String, usize)>,
    pub observations_fitted: usize,
    pub commit: CommitSummary,
}

impl CycleReport {
    /// Series that failed non-critically this cycle
    pub fn degraded(&self) -> Vec<&str> {
        self.series
            .iter()
            .filter(|s| s.status == IngestStatus::Degraded)
            .map(|s| s.series_id.as_str())
            .collect()
    }
}

/// Output of CLEAN/TRANSFORM: merged history plus everything derived from it
struct Refreshed {
    transform: TransformOutput,
    batch_points: Vec<SeriesPoint>,
    cursors: Vec<CursorUpdate>,
    reports: Vec<SeriesReport>,
}

/// Coordinates update cycles against one store
pub struct UpdateOrchestrator {
    config: PipelineConfig,
    sources: SourceRegistry,
    store: SeriesStore,
    calendar: Box<dyn ReportingCalendar>,
}

impl UpdateOrchestrator {
    /// Open the store configured in `config.data_dir`
    pub fn open(config: PipelineConfig, sources: SourceRegistry) -> Result<Self> {
        let store = SeriesStore::open(&config.store_path())?;
        Self::with_store(config, sources, store)
    }

    pub fn with_store(config: PipelineConfig, sources: SourceRegistry, store: SeriesStore) -> Result<Self> {
        config.validate()?;
        let calendar = calendar::from_config(&config.calendar)?;
        for series in &config.series {
            if sources.get(&series.source).is_none() {
                return Err(LiquidityError::ConfigError(format!(
                    "source '{}' for series '{}' is not registered",
                    series.source, series.name
                )));
            }
        }
        Ok(Self {
            config,
            sources,
            store,
            calendar,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    fn series_ids(&self) -> Vec<String> {
        self.config.series.iter().map(|s| s.name.clone()).collect()
    }

    /// Run one full cycle.
    ///
    /// Either every output of the cycle is committed together, or the store
    /// and ledger are left exactly as they were and the error names the
    /// failing stage.
    pub fn run_cycle(&mut self, mode: CycleMode) -> Result<CycleReport> {
        let _lock = CycleLock::acquire(&self.config.lock_path())?;
        self.store.check_consistency(&self.series_ids())?;

        let cycle_id = Uuid::new_v4().to_string();
        self.store.ledger().start_cycle(&cycle_id, mode.as_str())?;
        info!("Starting {} cycle {}", mode, cycle_id);

        let mut machine = StageMachine::new();
        match self.run_stages(&cycle_id, mode, &mut machine) {
            Ok(report) => {
                info!("Cycle {} committed", cycle_id);
                Ok(report)
            }
            Err(err) => {
                let stage = machine.fail().or_else(|| err.stage()).unwrap_or(Stage::Fetch);
                let err = err.in_stage(stage);
                error!("Cycle {} failed: {}", cycle_id, err);
                if let Err(log_err) =
                    self.store
                        .ledger()
                        .finish_cycle(&cycle_id, "failed", Some(stage.as_str()), Some(&err.to_string()))
                {
                    warn!("Failed to record outcome of cycle {}: {}", cycle_id, log_err);
                }
                Err(err)
            }
        }
    }

    fn run_stages(&mut self, cycle_id: &str, mode: CycleMode, machine: &mut StageMachine) -> Result<CycleReport> {
        machine.enter(Stage::Fetch)?;
        let staged = self.fetch(mode)?;
        machine.complete()?;

        machine.enter(Stage::Transform)?;
        let refreshed = self.refresh(staged)?;
        machine.complete()?;

        machine.enter(Stage::Retrain)?;
        let previous = self.previous_fits()?;
        let regimes = RegimeEngine::new(&self.config.model).run(&refreshed.transform.features, &previous)?;
        machine.complete()?;

        machine.enter(Stage::Commit)?;
        let report = self.commit(cycle_id, mode, refreshed, regimes)?;
        machine.complete()?;
        Ok(report)
    }

    /// FETCH: pull every series in parallel, retrying transient failures
    fn fetch(&self, mode: CycleMode) -> Result<Vec<StagedSeries>> {
        let ledger = self.store.ledger();
        let mut requests = Vec::with_capacity(self.config.series.len());
        for series in &self.config.series {
            let backfill_from = series.start.and_then(|d| d.pred_opt());
            let since = match mode {
                CycleMode::ColdStart => backfill_from,
                CycleMode::Incremental => ledger.get_cursor(&series.name)?.or(backfill_from),
            };
            requests.push((series, since));
        }

        // The store is not shared with the fetch workers
        let sources = &self.sources;
        let fetch_config = &self.config.fetch;
        let staged: Vec<StagedSeries> = requests
            .par_iter()
            .map(|(series, since)| fetch_series(sources, fetch_config, series, *since))
            .collect();

        // Only upstream outages fall under the critical/degraded policy;
        // invalid data is raised unchanged in CLEAN/TRANSFORM
        for result in &staged {
            let err = match &result.error {
                Some(err) if err.is_upstream() => err,
                _ => continue,
            };
            let critical = self
                .config
                .series_config(&result.series_id)
                .map_or(true, |s| s.critical);
            if critical {
                return Err(LiquidityError::PermanentUpstream {
                    series: result.series_id.clone(),
                    message: format!("critical series unavailable: {}", err),
                });
            }
            warn!("{} degraded this cycle: {}", result.series_id, err);
        }
        Ok(staged)
    }

    /// CLEAN/TRANSFORM: merge staged points into the committed history and
    /// recompute every composite over it
    fn refresh(&self, staged: Vec<StagedSeries>) -> Result<Refreshed> {
        let mut history: HashMap<String, Series> = HashMap::new();
        let mut batch_points = Vec::new();
        let mut cursors = Vec::new();
        let mut reports = Vec::with_capacity(staged.len());

        for fetched in staged {
            let detail = match fetched.error {
                Some(err) if err.is_upstream() => Some(err.to_string()),
                Some(err) => return Err(err),
                None => None,
            };
            let committed = self.store.load_series(&fetched.series_id)?;
            let outcome = merge_staged(&committed, &fetched.points)?;
            let cursor = outcome.series.last_timestamp();

            let status = if detail.is_some() {
                IngestStatus::Degraded
            } else if outcome.new_points.is_empty() {
                IngestStatus::NoNewData
            } else {
                IngestStatus::Ok
            };
            if !outcome.new_points.is_empty() {
                if let Some(last) = cursor {
                    cursors.push(CursorUpdate {
                        series_id: fetched.series_id.clone(),
                        last_timestamp: last,
                        fingerprint: batch_fingerprint(&outcome.new_points),
                    });
                }
            }
            debug!(
                "{}: {} new, {} duplicates, {} conflicts",
                fetched.series_id,
                outcome.new_points.len(),
                outcome.duplicates,
                outcome.conflicts.len()
            );

            reports.push(SeriesReport {
                series_id: fetched.series_id.clone(),
                status,
                rows_added: outcome.rows_added(),
                rows_total: outcome.series.len(),
                conflicts: outcome.conflicts.len(),
                cursor,
                detail,
            });
            batch_points.extend(outcome.new_points);
            history.insert(fetched.series_id.clone(), outcome.series);
        }

        let transform = transform::run(&self.config, self.calendar.as_ref(), &history)?;
        Ok(Refreshed {
            transform,
            batch_points,
            cursors,
            reports,
        })
    }

    /// Previously committed fits, for `previous_fit` label alignment
    fn previous_fits(&self) -> Result<PreviousFits> {
        Ok(PreviousFits {
            gmm: self.previous_fit(crate::regime::gmm::MODEL_NAME)?,
            hmm: self.previous_fit(crate::regime::hmm::MODEL_NAME)?,
        })
    }

    fn previous_fit<P: Serialize + DeserializeOwned>(&self, model: &str) -> Result<Option<FittedModel<P>>> {
        let stored = match self.store.latest_artifact(model)? {
            Some(stored) => stored,
            None => return Ok(None),
        };
        match FittedModel::from_artifact(&stored.artifact) {
            Ok(fit) => Ok(Some(fit)),
            Err(e) => {
                warn!("Ignoring unreadable {} artifact from cycle {}: {}", model, stored.cycle_id, e);
                Ok(None)
            }
        }
    }

    /// COMMIT: write points, composites, labels, artifacts, cursors and the
    /// audit log in one transaction
    fn commit(&mut self, cycle_id: &str, mode: CycleMode, refreshed: Refreshed, regimes: RegimeOutput) -> Result<CycleReport> {
        let ingest_log = refreshed
            .reports
            .iter()
            .map(|r| IngestLogEntry {
                cycle_id: cycle_id.to_string(),
                series_id: r.series_id.clone(),
                rows_added: r.rows_added,
                rows_total: r.rows_total,
                status: r.status,
                detail: r.detail.clone(),
            })
            .collect();

        let composites = refreshed
            .transform
            .composites
            .iter()
            .map(|c| (c.name.clone(), c.len()))
            .collect();
        let observations_fitted = refreshed.transform.features.n_rows();

        let batch = CommitBatch {
            cycle_id: cycle_id.to_string(),
            points: refreshed.batch_points,
            cursors: refreshed.cursors,
            composites: refreshed.transform.composites,
            labels: regimes.labels(),
            artifacts: regimes.artifacts()?,
            ingest_log,
        };
        let commit = self.store.commit(&batch)?;

        Ok(CycleReport {
            cycle_id: cycle_id.to_string(),
            mode,
            series: refreshed.reports,
            composites,
            observations_fitted,
            commit,
        })
    }
}

/// Fetch one series with retries; never fails, errors are carried in the result
fn fetch_series(
    sources: &SourceRegistry,
    config: &FetchConfig,
    series: &SeriesConfig,
    since: Option<Timestamp>,
) -> StagedSeries {
    let mut staged = StagedSeries {
        series_id: series.name.clone(),
        since,
        points: Vec::new(),
        attempts: 0,
        error: None,
    };
    let source = match sources.get(&series.source) {
        Some(source) => source,
        None => {
            staged.error = Some(LiquidityError::ConfigError(format!(
                "source '{}' is not registered",
                series.source
            )));
            return staged;
        }
    };
    let request = FetchRequest {
        upstream_id: &series.upstream_id,
        since,
        timeout: Duration::from_secs(config.timeout_secs),
    };

    let max_attempts = config.max_retries + 1;
    loop {
        staged.attempts += 1;
        let result = source
            .fetch_since(&request)
            .and_then(|obs| to_points(&series.name, since, obs));
        match result {
            Ok(points) => {
                info!(
                    "Fetched {} observations for {} from {} since {:?}",
                    points.len(),
                    series.name,
                    source.name(),
                    since
                );
                staged.points = points;
                return staged;
            }
            Err(e) if e.is_transient() && staged.attempts < max_attempts => {
                let backoff = config.backoff_ms * staged.attempts as u64;
                warn!(
                    "Attempt {}/{} for {} failed: {}; retrying in {}ms",
                    staged.attempts, max_attempts, series.name, e, backoff
                );
                thread::sleep(Duration::from_millis(backoff));
            }
            Err(e) => {
                warn!("Fetch for {} failed after {} attempts: {}", series.name, staged.attempts, e);
                staged.error = Some(e);
                return staged;
            }
        }
    }
}

/// Validate fetched observations and stage them as points
fn to_points(series_id: &str, since: Option<Timestamp>, observations: Vec<Observation>) -> Result<Vec<SeriesPoint>> {
    let mut previous: Option<Timestamp> = None;
    let mut points = Vec::with_capacity(observations.len());
    for obs in observations {
        if let Some(prev) = previous {
            if obs.timestamp < prev {
                return Err(LiquidityError::DataQuality {
                    series: series_id.to_string(),
                    timestamp: Some(obs.timestamp),
                    message: format!("non-monotonic timestamps ({} after {})", obs.timestamp, prev),
                });
            }
        }
        if !obs.value.is_finite() {
            return Err(LiquidityError::DataQuality {
                series: series_id.to_string(),
                timestamp: Some(obs.timestamp),
                message: format!("non-finite value {}", obs.value),
            });
        }
        if since.map_or(false, |s| obs.timestamp <= s) {
            debug!("{}: upstream returned {} at or before cursor", series_id, obs.timestamp);
        }
        previous = Some(obs.timestamp);
        points.push(SeriesPoint {
            series_id: series_id.to_string(),
            timestamp: obs.timestamp,
            value: obs.value,
            source_revision: obs.revision.unwrap_or_else(|| UNVERSIONED.to_string()),
        });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_to_points_rejects_non_monotonic() {
        let obs = vec![Observation::new(d(2024, 1, 10), 1.0), Observation::new(d(2024, 1, 3), 2.0)];
        let err = to_points("fed_assets", None, obs).unwrap_err();
        assert!(matches!(err, LiquidityError::DataQuality { .. }));
    }

    #[test]
    fn test_to_points_rejects_non_finite() {
        let obs = vec![Observation::new(d(2024, 1, 3), f64::NAN)];
        assert!(to_points("tga", None, obs).is_err());
    }

    #[test]
    fn test_to_points_keeps_revision() {
        let mut obs = Observation::new(d(2024, 1, 3), 5.0);
        obs.revision = Some("2024-01-05".to_string());
        let points = to_points("tga", Some(d(2024, 1, 1)), vec![obs, Observation::new(d(2024, 1, 10), 6.0)]).unwrap();
        assert_eq!(points[0].source_revision, "2024-01-05");
        assert_eq!(points[1].source_revision, UNVERSIONED);
        assert_eq!(points[1].series_id, "tga");
    }
}
