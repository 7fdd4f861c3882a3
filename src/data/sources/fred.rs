//! FRED observations API
//!
//! Provides access to Federal Reserve Economic Data series such as WALCL,
//! RRPONTSYD and WTREGEN.

use super::{FetchRequest, UpstreamSource};
use crate::error::{LiquidityError, Result};
use crate::types::Observation;
use chrono::{Duration, NaiveDate};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;

const FRED_BASE_URL: &str = "https://api.stlouisfed.org/fred";

/// FRED data source
pub struct FredSource {
    name: String,
    api_key: String,
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct FredResponse {
    #[serde(default)]
    observations: Vec<FredObservation>,
}

#[derive(Debug, Deserialize)]
struct FredObservation {
    date: String,
    value: String,
    #[serde(default)]
    realtime_start: Option<String>,
}

impl FredSource {
    /// Create a new FRED data source
    pub fn new(name: String, api_key: String) -> Result<Self> {
        let client = Client::builder().build().map_err(|e| {
            LiquidityError::ConfigError(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            name,
            api_key,
            base_url: FRED_BASE_URL.to_string(),
            client,
        })
    }

    /// Point the source at a different endpoint (mirrors, test servers)
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn classify_status(&self, upstream_id: &str, status: StatusCode) -> LiquidityError {
        let message = format!("HTTP {}", status);
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            LiquidityError::TransientUpstream {
                series: upstream_id.to_string(),
                message,
            }
        } else {
            LiquidityError::PermanentUpstream {
                series: upstream_id.to_string(),
                message,
            }
        }
    }

    fn parse_observations(&self, upstream_id: &str, response: FredResponse) -> Result<Vec<Observation>> {
        let mut observations = Vec::with_capacity(response.observations.len());
        for obs in response.observations {
            let timestamp = NaiveDate::parse_from_str(&obs.date, "%Y-%m-%d").map_err(|e| {
                LiquidityError::DataQuality {
                    series: upstream_id.to_string(),
                    timestamp: None,
                    message: format!("Date parse error: {}", e),
                }
            })?;
            // "." marks a missing observation
            let value = match obs.value.trim().parse::<f64>() {
                Ok(v) => v,
                Err(_) => continue,
            };
            observations.push(Observation {
                timestamp,
                value,
                revision: obs.realtime_start,
            });
        }
        observations.sort_by_key(|o| o.timestamp);
        Ok(observations)
    }
}

impl UpstreamSource for FredSource {
    fn fetch_since(&self, request: &FetchRequest<'_>) -> Result<Vec<Observation>> {
        let url = format!("{}/series/observations", self.base_url);
        let mut query = vec![
            ("series_id", request.upstream_id.to_string()),
            ("api_key", self.api_key.clone()),
            ("file_type", "json".to_string()),
        ];
        if let Some(since) = request.since {
            let start = since + Duration::days(1);
            query.push(("observation_start", start.format("%Y-%m-%d").to_string()));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .timeout(request.timeout)
            .send()
            .map_err(|e| {
                let message = format!("HTTP request failed: {}", e);
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    LiquidityError::TransientUpstream {
                        series: request.upstream_id.to_string(),
                        message,
                    }
                } else {
                    LiquidityError::PermanentUpstream {
                        series: request.upstream_id.to_string(),
                        message,
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.classify_status(request.upstream_id, status));
        }

        let body: FredResponse = response.json().map_err(|e| LiquidityError::PermanentUpstream {
            series: request.upstream_id.to_string(),
            message: format!("JSON parse error: {}", e),
        })?;

        self.parse_observations(request.upstream_id, body)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fred_source_creation() {
        let source = FredSource::new("fred".to_string(), "test_key".to_string());
        assert!(source.is_ok());
    }

    #[test]
    fn test_parse_skips_missing_marker() {
        let source = FredSource::new("fred".to_string(), "k".to_string()).unwrap();
        let body: FredResponse = serde_json::from_str(
            r#"{"observations":[
                {"realtime_start":"2024-01-05","date":"2024-01-03","value":"7713653"},
                {"realtime_start":"2024-01-12","date":"2024-01-10","value":"."}
            ]}"#,
        )
        .unwrap();
        let obs = source.parse_observations("WALCL", body).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].value, 7_713_653.0);
        assert_eq!(obs[0].revision.as_deref(), Some("2024-01-05"));
    }

    #[test]
    fn test_status_classification() {
        let source = FredSource::new("fred".to_string(), "k".to_string()).unwrap();
        assert!(source
            .classify_status("WALCL", StatusCode::TOO_MANY_REQUESTS)
            .is_transient());
        assert!(source
            .classify_status("WALCL", StatusCode::BAD_GATEWAY)
            .is_transient());
        assert!(!source.classify_status("WALCL", StatusCode::BAD_REQUEST).is_transient());
    }
}
