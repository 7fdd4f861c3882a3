//! Directory of CSV files, one per upstream identifier
//!
//! Each `<upstream_id>.csv` carries `date,value` columns (header names are
//! matched case-insensitively). FRED's `.` missing-value marker and empty
//! cells are skipped.

use super::{FetchRequest, UpstreamSource};
use crate::error::{LiquidityError, Result};
use crate::types::Observation;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use std::path::PathBuf;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct CsvDirSource {
    name: String,
    dir: PathBuf,
}

impl CsvDirSource {
    pub fn new(name: String, dir: PathBuf) -> Self {
        Self { name, dir }
    }

    fn path_for(&self, upstream_id: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", upstream_id))
    }

    /// Find column index by name
    fn find_column(headers: &csv::StringRecord, name: &str, upstream_id: &str) -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| LiquidityError::PermanentUpstream {
                series: upstream_id.to_string(),
                message: format!("column '{}' not found", name),
            })
    }
}

impl UpstreamSource for CsvDirSource {
    fn fetch_since(&self, request: &FetchRequest<'_>) -> Result<Vec<Observation>> {
        let path = self.path_for(request.upstream_id);
        if !path.exists() {
            return Err(LiquidityError::PermanentUpstream {
                series: request.upstream_id.to_string(),
                message: format!("file not found: {}", path.display()),
            });
        }

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)
            .map_err(|e| LiquidityError::TransientUpstream {
                series: request.upstream_id.to_string(),
                message: format!("Failed to open CSV: {}", e),
            })?;

        let headers = rdr
            .headers()
            .map_err(|e| LiquidityError::PermanentUpstream {
                series: request.upstream_id.to_string(),
                message: format!("Failed to read headers: {}", e),
            })?
            .clone();
        let date_idx = Self::find_column(&headers, "date", request.upstream_id)?;
        let value_idx = Self::find_column(&headers, "value", request.upstream_id)?;

        let mut observations = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| LiquidityError::PermanentUpstream {
                series: request.upstream_id.to_string(),
                message: format!("Failed to read record {}: {}", line + 1, e),
            })?;

            let date_str = record.get(date_idx).unwrap_or("").trim();
            let timestamp = NaiveDate::parse_from_str(date_str, DATE_FORMAT).map_err(|_| {
                LiquidityError::DataQuality {
                    series: request.upstream_id.to_string(),
                    timestamp: None,
                    message: format!("invalid date '{}' on record {}", date_str, line + 1),
                }
            })?;

            if request.since.map_or(false, |since| timestamp <= since) {
                continue;
            }

            let raw = record.get(value_idx).unwrap_or("").trim();
            if raw.is_empty() || raw == "." {
                continue;
            }
            let value: f64 = raw.parse().map_err(|_| LiquidityError::DataQuality {
                series: request.upstream_id.to_string(),
                timestamp: Some(timestamp),
                message: format!("invalid value '{}'", raw),
            })?;

            observations.push(Observation::new(timestamp, value));
        }

        Ok(observations)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
