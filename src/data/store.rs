//! SQLite series store
//!
//! Append-only storage of raw series points plus the derived outputs of a
//! cycle (composites, regime labels, model artifacts). Every revision of a
//! point is kept; reads see the latest revision per (series, timestamp).
//! Everything a cycle produces is written by `commit` in one transaction,
//! together with the ledger cursors that describe it.

use super::ledger::{IngestLogEntry, Ledger, RecordOutcome};
use crate::error::{LiquidityError, Result};
use crate::types::{
    CompositePoint, CompositeSeries, RegimeLabel, RegimeLabelSeries, Series, SeriesPoint, Timestamp,
};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Ledger cursor advanced by a commit
#[derive(Debug, Clone, PartialEq)]
pub struct CursorUpdate {
    pub series_id: String,
    pub last_timestamp: Timestamp,
    pub fingerprint: String,
}

/// Persisted parameters of a fitted model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model: String,
    pub params: serde_json::Value,
}

/// Artifact as read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub cycle_id: String,
    pub created_at: DateTime<Utc>,
    pub artifact: ModelArtifact,
}

/// Everything one cycle commits
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub cycle_id: String,
    /// New points and changed revisions; duplicates are already removed
    pub points: Vec<SeriesPoint>,
    pub cursors: Vec<CursorUpdate>,
    /// Replace the stored composite of the same name
    pub composites: Vec<CompositeSeries>,
    /// Replace the stored labels of the same model
    pub labels: Vec<RegimeLabelSeries>,
    pub artifacts: Vec<ModelArtifact>,
    pub ingest_log: Vec<IngestLogEntry>,
}

/// What a commit changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSummary {
    pub points_written: usize,
    pub cursors_advanced: usize,
    pub composites_written: usize,
    pub labels_written: usize,
}

/// SQLite-backed store for series, ledger and derived outputs
pub struct SeriesStore {
    conn: Connection,
}

impl SeriesStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| {
            LiquidityError::DataError(format!("Failed to open store {}: {}", path.display(), e))
        })?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LiquidityError::DataError(format!("Failed to open database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS series_points (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                series_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                value REAL NOT NULL,
                source_revision TEXT NOT NULL,
                cycle_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_series_points_key ON series_points(series_id, ts);

            CREATE TABLE IF NOT EXISTS composite_points (
                name TEXT NOT NULL,
                ts TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (name, ts)
            );

            CREATE TABLE IF NOT EXISTS composite_params (
                name TEXT PRIMARY KEY,
                params TEXT NOT NULL,
                cycle_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS regime_labels (
                model TEXT NOT NULL,
                ts TEXT NOT NULL,
                regime INTEGER NOT NULL,
                probabilities TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                PRIMARY KEY (model, ts)
            );

            CREATE TABLE IF NOT EXISTS model_artifacts (
                cycle_id TEXT NOT NULL,
                model TEXT NOT NULL,
                created_at TEXT NOT NULL,
                params TEXT NOT NULL,
                PRIMARY KEY (cycle_id, model)
            );",
        )?;
        Ledger::create_tables(&self.conn)?;
        Ok(())
    }

    /// Ledger view over this store's connection
    pub fn ledger(&self) -> Ledger<'_> {
        Ledger::new(&self.conn)
    }

    /// Latest revision of every point of a series, ascending by timestamp
    pub fn load_series(&self, series_id: &str) -> Result<Series> {
        let mut stmt = self.conn.prepare(
            "SELECT series_id, ts, value, source_revision FROM series_points
             WHERE seq IN (
                SELECT MAX(seq) FROM series_points WHERE series_id = ?1 GROUP BY ts
             )
             ORDER BY ts",
        )?;
        let points = stmt
            .query_map(params![series_id], |row| {
                Ok(SeriesPoint {
                    series_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    value: row.get(2)?,
                    source_revision: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Series::from_points(series_id, points)
    }

    /// Latest stored timestamp of a series
    pub fn max_timestamp(&self, series_id: &str) -> Result<Option<Timestamp>> {
        let ts = self.conn.query_row(
            "SELECT MAX(ts) FROM series_points WHERE series_id = ?1",
            params![series_id],
            |row| row.get::<_, Option<Timestamp>>(0),
        )?;
        Ok(ts)
    }

    /// Number of stored rows (all revisions) of a series
    pub fn revision_count(&self, series_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM series_points WHERE series_id = ?1",
            params![series_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Stored composite with its parameter record
    pub fn load_composite(&self, name: &str) -> Result<Option<CompositeSeries>> {
        let params_json: Option<String> = self
            .conn
            .query_row(
                "SELECT params FROM composite_params WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let params_json = match params_json {
            Some(p) => p,
            None => return Ok(None),
        };

        let mut stmt = self
            .conn
            .prepare("SELECT ts, value FROM composite_points WHERE name = ?1 ORDER BY ts")?;
        let points = stmt
            .query_map(params![name], |row| {
                Ok(CompositePoint {
                    timestamp: row.get(0)?,
                    value: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(CompositeSeries {
            name: name.to_string(),
            parameters: serde_json::from_str(&params_json)?,
            points,
        }))
    }

    /// Names of all stored composites
    pub fn composite_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM composite_params ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Stored regime labels of one model
    pub fn load_labels(&self, model: &str) -> Result<Option<RegimeLabelSeries>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, regime, probabilities FROM regime_labels WHERE model = ?1 ORDER BY ts",
        )?;
        let rows = stmt
            .query_map(params![model], |row| {
                Ok((
                    row.get::<_, Timestamp>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut labels = Vec::with_capacity(rows.len());
        for (timestamp, regime, probabilities) in rows {
            labels.push(RegimeLabel {
                timestamp,
                regime: regime as usize,
                probabilities: serde_json::from_str(&probabilities)?,
            });
        }
        Ok(Some(RegimeLabelSeries {
            model: model.to_string(),
            labels,
        }))
    }

    /// Most recently committed artifact of a model
    pub fn latest_artifact(&self, model: &str) -> Result<Option<StoredArtifact>> {
        let row = self
            .conn
            .query_row(
                "SELECT cycle_id, created_at, params FROM model_artifacts
                 WHERE model = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![model],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, DateTime<Utc>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((cycle_id, created_at, params_json)) => Ok(Some(StoredArtifact {
                cycle_id,
                created_at,
                artifact: ModelArtifact {
                    model: model.to_string(),
                    params: serde_json::from_str(&params_json)?,
                },
            })),
            None => Ok(None),
        }
    }

    /// Verify that no ledger cursor points past the data it describes.
    ///
    /// A cursor with no stored data, or ahead of the stored maximum, means a
    /// commit was only partially applied; the store must not be used until
    /// an operator repairs it.
    pub fn check_consistency(&self, series_ids: &[String]) -> Result<()> {
        let ledger = self.ledger();
        for series_id in series_ids {
            let cursor = match ledger.get_cursor(series_id)? {
                Some(c) => c,
                None => continue,
            };
            match self.max_timestamp(series_id)? {
                Some(stored) if stored >= cursor => {}
                Some(stored) => {
                    return Err(LiquidityError::Consistency {
                        series: series_id.clone(),
                        cursor,
                        stored: stored.to_string(),
                    })
                }
                None => {
                    return Err(LiquidityError::Consistency {
                        series: series_id.clone(),
                        cursor,
                        stored: "no data".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Apply a cycle's outputs atomically.
    ///
    /// Points, composites, labels, artifacts, ledger cursors, the audit log
    /// and the cycle outcome either all become visible or none do.
    pub fn commit(&mut self, batch: &CommitBatch) -> Result<CommitSummary> {
        let tx = self.conn.transaction()?;
        let mut summary = CommitSummary::default();

        {
            let mut insert_point = tx.prepare(
                "INSERT INTO series_points (series_id, ts, value, source_revision, cycle_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for point in &batch.points {
                insert_point.execute(params![
                    &point.series_id,
                    point.timestamp,
                    point.value,
                    &point.source_revision,
                    &batch.cycle_id,
                ])?;
                summary.points_written += 1;
            }
        }

        for composite in &batch.composites {
            tx.execute(
                "DELETE FROM composite_points WHERE name = ?1",
                params![&composite.name],
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO composite_points (name, ts, value) VALUES (?1, ?2, ?3)",
            )?;
            for point in &composite.points {
                insert.execute(params![&composite.name, point.timestamp, point.value])?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO composite_params (name, params, cycle_id) VALUES (?1, ?2, ?3)",
                params![
                    &composite.name,
                    serde_json::to_string(&composite.parameters)?,
                    &batch.cycle_id
                ],
            )?;
            summary.composites_written += 1;
        }

        for series in &batch.labels {
            tx.execute("DELETE FROM regime_labels WHERE model = ?1", params![&series.model])?;
            let mut insert = tx.prepare(
                "INSERT INTO regime_labels (model, ts, regime, probabilities, cycle_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for label in &series.labels {
                insert.execute(params![
                    &series.model,
                    label.timestamp,
                    label.regime as i64,
                    serde_json::to_string(&label.probabilities)?,
                    &batch.cycle_id,
                ])?;
                summary.labels_written += 1;
            }
        }

        let now = Utc::now();
        for artifact in &batch.artifacts {
            tx.execute(
                "INSERT OR REPLACE INTO model_artifacts (cycle_id, model, created_at, params)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    &batch.cycle_id,
                    &artifact.model,
                    now,
                    serde_json::to_string(&artifact.params)?
                ],
            )?;
        }

        {
            let ledger = Ledger::new(&tx);
            for cursor in &batch.cursors {
                let outcome = ledger.record(&cursor.series_id, cursor.last_timestamp, &cursor.fingerprint)?;
                if outcome == RecordOutcome::Advanced {
                    debug!("Ledger cursor for {} -> {}", cursor.series_id, cursor.last_timestamp);
                    summary.cursors_advanced += 1;
                }
            }
            ledger.append_ingest_log(&batch.ingest_log)?;
            ledger.finish_cycle(&batch.cycle_id, "committed", None, None)?;
        }

        tx.commit()?;
        info!(
            "Committed cycle {}: {} points, {} cursors advanced, {} composites, {} labels",
            batch.cycle_id,
            summary.points_written,
            summary.cursors_advanced,
            summary.composites_written,
            summary.labels_written
        );
        Ok(summary)
    }

    /// Digest of the raw store and ledger contents.
    ///
    /// Two stores with equal digests hold the same points, revisions and
    /// cursors.
    pub fn content_digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();

        let mut stmt = self.conn.prepare(
            "SELECT series_id, ts, value, source_revision FROM series_points ORDER BY seq",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let series_id: String = row.get(0)?;
            let ts: String = row.get(1)?;
            let value: f64 = row.get(2)?;
            let revision: String = row.get(3)?;
            hasher.update(format!("{}|{}|{}|{}\n", series_id, ts, value.to_bits(), revision).as_bytes());
        }

        for entry in self.ledger().entries()? {
            hasher.update(
                format!(
                    "{}|{}|{}|{}\n",
                    entry.series_id,
                    entry.last_ingested,
                    entry.fingerprint,
                    entry.ingested_at.to_rfc3339()
                )
                .as_bytes(),
            );
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}
