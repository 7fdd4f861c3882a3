//! Ingestion ledger (manifest)
//!
//! Tracks, per series, the last ingested timestamp and the fingerprint of the
//! batch that moved it, plus an append-only audit log of every cycle. The
//! ledger lives in the same SQLite database as the series store so that a
//! cursor can only advance inside the transaction that writes its data.

use crate::error::{LiquidityError, Result};
use crate::types::{SeriesPoint, Timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Current cursor of one series
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub series_id: String,
    pub last_ingested: Timestamp,
    pub fingerprint: String,
    pub ingested_at: DateTime<Utc>,
}

/// Result of `Ledger::record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Advanced,
    /// Same (series, timestamp, fingerprint) already recorded
    Unchanged,
}

/// Per-series status of one ingest attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ok,
    NoNewData,
    Degraded,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Ok => "ok",
            IngestStatus::NoNewData => "no_new_data",
            IngestStatus::Degraded => "degraded",
            IngestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audit row: what a cycle did to one series
#[derive(Debug, Clone, PartialEq)]
pub struct IngestLogEntry {
    pub cycle_id: String,
    pub series_id: String,
    pub rows_added: usize,
    pub rows_total: usize,
    pub status: IngestStatus,
    pub detail: Option<String>,
}

/// One row of the cycle log
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: String,
    pub failed_stage: Option<String>,
    pub detail: Option<String>,
}

/// SHA-256 fingerprint of an ingested batch
pub fn batch_fingerprint(points: &[SeriesPoint]) -> String {
    let mut hasher = Sha256::new();
    for point in points {
        hasher.update(point.series_id.as_bytes());
        hasher.update(b"|");
        hasher.update(point.timestamp.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(point.value.to_bits().to_le_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Ledger view over the store's connection (or an open transaction)
pub struct Ledger<'c> {
    conn: &'c Connection,
}

impl<'c> Ledger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create ledger tables
    pub fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ledger (
                series_id TEXT PRIMARY KEY,
                last_ingested TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ingest_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                logged_at TEXT NOT NULL,
                series_id TEXT NOT NULL,
                rows_added INTEGER NOT NULL,
                rows_total INTEGER NOT NULL,
                status TEXT NOT NULL,
                detail TEXT
            );

            CREATE TABLE IF NOT EXISTS cycles (
                cycle_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                outcome TEXT NOT NULL,
                failed_stage TEXT,
                detail TEXT
            );",
        )?;
        Ok(())
    }

    /// Last ingested timestamp; `None` means never ingested (full backfill)
    pub fn get_cursor(&self, series_id: &str) -> Result<Option<Timestamp>> {
        Ok(self.entry(series_id)?.map(|e| e.last_ingested))
    }

    /// Full ledger entry for one series
    pub fn entry(&self, series_id: &str) -> Result<Option<LedgerEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT series_id, last_ingested, fingerprint, ingested_at FROM ledger WHERE series_id = ?1",
                params![series_id],
                |row| {
                    Ok(LedgerEntry {
                        series_id: row.get(0)?,
                        last_ingested: row.get(1)?,
                        fingerprint: row.get(2)?,
                        ingested_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// All ledger entries ordered by series id
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT series_id, last_ingested, fingerprint, ingested_at FROM ledger ORDER BY series_id",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    series_id: row.get(0)?,
                    last_ingested: row.get(1)?,
                    fingerprint: row.get(2)?,
                    ingested_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Advance the cursor of a series.
    ///
    /// Must only be called once the batch is written through the same
    /// connection/transaction. Re-recording an identical entry is a no-op;
    /// moving a cursor backwards is an error.
    pub fn record(&self, series_id: &str, last_timestamp: Timestamp, fingerprint: &str) -> Result<RecordOutcome> {
        if let Some(existing) = self.entry(series_id)? {
            if existing.last_ingested == last_timestamp && existing.fingerprint == fingerprint {
                return Ok(RecordOutcome::Unchanged);
            }
            if existing.last_ingested > last_timestamp {
                return Err(LiquidityError::DataError(format!(
                    "ledger cursor for {} would move backwards ({} -> {})",
                    series_id, existing.last_ingested, last_timestamp
                )));
            }
        }

        self.conn.execute(
            "INSERT INTO ledger (series_id, last_ingested, fingerprint, ingested_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(series_id) DO UPDATE SET
                last_ingested = excluded.last_ingested,
                fingerprint = excluded.fingerprint,
                ingested_at = excluded.ingested_at",
            params![series_id, last_timestamp, fingerprint, Utc::now()],
        )?;
        Ok(RecordOutcome::Advanced)
    }

    /// Append audit rows
    pub fn append_ingest_log(&self, entries: &[IngestLogEntry]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO ingest_log (cycle_id, logged_at, series_id, rows_added, rows_total, status, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        let now = Utc::now();
        for entry in entries {
            stmt.execute(params![
                &entry.cycle_id,
                now,
                &entry.series_id,
                entry.rows_added as i64,
                entry.rows_total as i64,
                entry.status.as_str(),
                &entry.detail,
            ])?;
        }
        Ok(())
    }

    /// Audit rows of one cycle
    pub fn ingest_log(&self, cycle_id: &str) -> Result<Vec<IngestLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_id, series_id, rows_added, rows_total, status, detail
             FROM ingest_log WHERE cycle_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![cycle_id], |row| {
                let status: String = row.get(4)?;
                Ok(IngestLogEntry {
                    cycle_id: row.get(0)?,
                    series_id: row.get(1)?,
                    rows_added: row.get::<_, i64>(2)? as usize,
                    rows_total: row.get::<_, i64>(3)? as usize,
                    status: Self::parse_status(&status),
                    detail: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn parse_status(value: &str) -> IngestStatus {
        match value {
            "ok" => IngestStatus::Ok,
            "no_new_data" => IngestStatus::NoNewData,
            "degraded" => IngestStatus::Degraded,
            _ => IngestStatus::Failed,
        }
    }

    /// Open a cycle log row
    pub fn start_cycle(&self, cycle_id: &str, mode: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cycles (cycle_id, mode, started_at, outcome) VALUES (?1, ?2, ?3, 'running')",
            params![cycle_id, mode, Utc::now()],
        )?;
        Ok(())
    }

    /// Close a cycle log row
    pub fn finish_cycle(
        &self,
        cycle_id: &str,
        outcome: &str,
        failed_stage: Option<&str>,
        detail: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE cycles SET finished_at = ?2, outcome = ?3, failed_stage = ?4, detail = ?5 WHERE cycle_id = ?1",
            params![cycle_id, Utc::now(), outcome, failed_stage, detail],
        )?;
        Ok(())
    }

    /// Most recent cycles, newest first
    pub fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_id, mode, started_at, finished_at, outcome, failed_stage, detail
             FROM cycles ORDER BY started_at DESC, rowid DESC LIMIT ?1",
        )?;
        let cycles = stmt
            .query_map(params![limit as i64], |row| {
                Ok(CycleRecord {
                    cycle_id: row.get(0)?,
                    mode: row.get(1)?,
                    started_at: row.get(2)?,
                    finished_at: row.get(3)?,
                    outcome: row.get(4)?,
                    failed_stage: row.get(5)?,
                    detail: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ledger_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        Ledger::create_tables(&conn).unwrap();
        conn
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_absent_cursor_means_never_ingested() {
        let conn = ledger_conn();
        assert_eq!(Ledger::new(&conn).get_cursor("WALCL").unwrap(), None);
    }

    #[test]
    fn test_record_is_idempotent() {
        let conn = ledger_conn();
        let ledger = Ledger::new(&conn);
        assert_eq!(ledger.record("WALCL", d(3), "abc").unwrap(), RecordOutcome::Advanced);
        let first = ledger.entry("WALCL").unwrap().unwrap();

        assert_eq!(ledger.record("WALCL", d(3), "abc").unwrap(), RecordOutcome::Unchanged);
        let second = ledger.entry("WALCL").unwrap().unwrap();
        assert_eq!(first, second);

        assert_eq!(ledger.record("WALCL", d(10), "def").unwrap(), RecordOutcome::Advanced);
        assert_eq!(ledger.get_cursor("WALCL").unwrap(), Some(d(10)));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let conn = ledger_conn();
        let ledger = Ledger::new(&conn);
        ledger.record("WALCL", d(10), "abc").unwrap();
        assert!(ledger.record("WALCL", d(3), "zzz").is_err());
        assert_eq!(ledger.get_cursor("WALCL").unwrap(), Some(d(10)));
    }

    #[test]
    fn test_fingerprint_depends_on_values() {
        let point = |value: f64| SeriesPoint {
            series_id: "WALCL".to_string(),
            timestamp: d(3),
            value,
            source_revision: "r".to_string(),
        };
        assert_eq!(batch_fingerprint(&[point(1.0)]), batch_fingerprint(&[point(1.0)]));
        assert_ne!(batch_fingerprint(&[point(1.0)]), batch_fingerprint(&[point(1.5)]));
    }

    #[test]
    fn test_cycle_log_roundtrip() {
        let conn = ledger_conn();
        let ledger = Ledger::new(&conn);
        ledger.start_cycle("c1", "incremental").unwrap();
        ledger
            .finish_cycle("c1", "failed", Some("RETRAIN"), Some("singular covariance"))
            .unwrap();
        ledger
            .append_ingest_log(&[IngestLogEntry {
                cycle_id: "c1".to_string(),
                series_id: "WALCL".to_string(),
                rows_added: 0,
                rows_total: 10,
                status: IngestStatus::NoNewData,
                detail: None,
            }])
            .unwrap();

        let cycles = ledger.recent_cycles(5).unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].outcome, "failed");
        assert_eq!(cycles[0].failed_stage.as_deref(), Some("RETRAIN"));
        assert_eq!(ledger.ingest_log("c1").unwrap()[0].status, IngestStatus::NoNewData);
    }
}
