//! Upstream source collaborators
//!
//! A source answers one question: given an upstream identifier and a "since"
//! bound, which observations are newer than that bound. Failures are split
//! into transient (retried by the orchestrator) and permanent (surfaced).
//!
//! - `CsvDirSource`: one `<upstream_id>.csv` file per series
//! - `FredSource`: FRED observations API (`http` feature)
//! - `InMemorySource`: programmatic source for tests and replays

pub mod csv_dir;
#[cfg(feature = "http")]
pub mod fred;

pub use csv_dir::CsvDirSource;
#[cfg(feature = "http")]
pub use fred::FredSource;

use crate::config::{PipelineConfig, SourceConfig};
use crate::error::{LiquidityError, Result};
use crate::types::{Observation, Timestamp};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Parameters of a single upstream request
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub upstream_id: &'a str,
    /// Only observations strictly after this date are wanted; `None` = full history
    pub since: Option<Timestamp>,
    /// Deadline the source's transport must enforce
    pub timeout: Duration,
}

/// Trait for upstream statistical sources
pub trait UpstreamSource: Send + Sync {
    /// Fetch observations newer than `request.since`, ordered by timestamp
    fn fetch_since(&self, request: &FetchRequest<'_>) -> Result<Vec<Observation>>;

    /// Get the source name
    fn name(&self) -> &str;
}

/// Registry for managing multiple data sources
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn UpstreamSource>>,
}

impl SourceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    /// Build every source named in the configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (name, source) in &config.sources {
            match source {
                SourceConfig::CsvDir { path } => {
                    registry.register(name.clone(), CsvDirSource::new(name.clone(), path.clone()));
                }
                #[cfg(feature = "http")]
                SourceConfig::Fred {
                    api_key_env,
                    base_url,
                } => {
                    let api_key = std::env::var(api_key_env).map_err(|_| {
                        LiquidityError::ConfigError(format!(
                            "source '{}' needs the {} environment variable",
                            name, api_key_env
                        ))
                    })?;
                    let mut fred = FredSource::new(name.clone(), api_key)?;
                    if let Some(url) = base_url {
                        fred = fred.with_base_url(url.clone());
                    }
                    registry.register(name.clone(), fred);
                }
                #[cfg(not(feature = "http"))]
                SourceConfig::Fred { .. } => {
                    return Err(LiquidityError::ConfigError(format!(
                        "source '{}' is a FRED source but the crate was built without the `http` feature",
                        name
                    )));
                }
            }
        }
        Ok(registry)
    }

    /// Register a data source
    pub fn register<S: UpstreamSource + 'static>(&mut self, name: String, source: S) {
        self.sources.insert(name, Arc::new(source));
    }

    /// Register an already shared data source
    pub fn register_shared(&mut self, name: String, source: Arc<dyn UpstreamSource>) {
        self.sources.insert(name, source);
    }

    /// Get a registered data source
    pub fn get(&self, name: &str) -> Option<Arc<dyn UpstreamSource>> {
        self.sources.get(name).cloned()
    }

    /// List all registered source names
    pub fn list_sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scripted failure for an in-memory series
#[derive(Debug, Clone)]
enum Failure {
    /// Fail transiently this many more times, then succeed
    Transient(u32),
    Permanent,
}

/// In-memory source; keeps full histories and answers "since" queries over them
#[derive(Default)]
pub struct InMemorySource {
    name: String,
    data: Mutex<HashMap<String, Vec<Observation>>>,
    failures: Mutex<HashMap<String, Failure>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl InMemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Replace the full upstream history of one identifier
    pub fn set_series(&self, upstream_id: &str, observations: Vec<Observation>) {
        if let Ok(mut data) = self.data.lock() {
            data.insert(upstream_id.to_string(), observations);
        }
    }

    /// Append newly published observations
    pub fn publish(&self, upstream_id: &str, observations: Vec<Observation>) {
        if let Ok(mut data) = self.data.lock() {
            data.entry(upstream_id.to_string())
                .or_insert_with(Vec::new)
                .extend(observations);
        }
    }

    /// Fail the next `times` requests for `upstream_id` with a transient error
    pub fn fail_transiently(&self, upstream_id: &str, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(upstream_id.to_string(), Failure::Transient(times));
        }
    }

    /// Fail every request for `upstream_id` with a permanent error
    pub fn fail_permanently(&self, upstream_id: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(upstream_id.to_string(), Failure::Permanent);
        }
    }

    /// Clear scripted failures
    pub fn recover(&self, upstream_id: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(upstream_id);
        }
    }

    /// Number of requests received for `upstream_id`
    pub fn call_count(&self, upstream_id: &str) -> u32 {
        self.calls
            .lock()
            .map(|calls| calls.get(upstream_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn poisoned(&self) -> LiquidityError {
        LiquidityError::DataError(format!("source {} lock poisoned", self.name))
    }
}

impl UpstreamSource for InMemorySource {
    fn fetch_since(&self, request: &FetchRequest<'_>) -> Result<Vec<Observation>> {
        {
            let mut calls = self.calls.lock().map_err(|_| self.poisoned())?;
            *calls.entry(request.upstream_id.to_string()).or_insert(0) += 1;
        }

        {
            let mut failures = self.failures.lock().map_err(|_| self.poisoned())?;
            match failures.get_mut(request.upstream_id) {
                Some(Failure::Permanent) => {
                    return Err(LiquidityError::PermanentUpstream {
                        series: request.upstream_id.to_string(),
                        message: "scripted permanent failure".to_string(),
                    });
                }
                Some(Failure::Transient(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(LiquidityError::TransientUpstream {
                        series: request.upstream_id.to_string(),
                        message: "scripted transient failure".to_string(),
                    });
                }
                _ => {}
            }
        }

        let data = self.data.lock().map_err(|_| self.poisoned())?;
        let mut observations: Vec<Observation> = data
            .get(request.upstream_id)
            .map(|obs| {
                obs.iter()
                    .filter(|o| request.since.map_or(true, |since| o.timestamp > since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        observations.sort_by_key(|o| o.timestamp);
        Ok(observations)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn request(since: Option<NaiveDate>) -> FetchRequest<'static> {
        FetchRequest {
            upstream_id: "WALCL",
            since,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = SourceRegistry::new();
        assert_eq!(registry.list_sources().len(), 0);
        registry.register("mem".to_string(), InMemorySource::new("mem"));
        assert!(registry.get("mem").is_some());
        assert_eq!(registry.list_sources(), vec!["mem".to_string()]);
    }

    #[test]
    fn test_in_memory_since_filter() {
        let source = InMemorySource::new("mem");
        source.set_series(
            "WALCL",
            vec![Observation::new(d(3), 1.0), Observation::new(d(10), 2.0)],
        );
        assert_eq!(source.fetch_since(&request(None)).unwrap().len(), 2);
        let newer = source.fetch_since(&request(Some(d(3)))).unwrap();
        assert_eq!(newer, vec![Observation::new(d(10), 2.0)]);
        assert!(source.fetch_since(&request(Some(d(10)))).unwrap().is_empty());
    }

    #[test]
    fn test_in_memory_scripted_failures() {
        let source = InMemorySource::new("mem");
        source.set_series("WALCL", vec![Observation::new(d(3), 1.0)]);
        source.fail_transiently("WALCL", 1);
        let first = source.fetch_since(&request(None)).unwrap_err();
        assert!(first.is_transient());
        assert!(source.fetch_since(&request(None)).is_ok());

        source.fail_permanently("WALCL");
        let err = source.fetch_since(&request(None)).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(source.call_count("WALCL"), 3);
    }
}
