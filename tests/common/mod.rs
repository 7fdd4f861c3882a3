//! Shared fixtures for the integration tests

#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use liquidity_regimes::config::PipelineConfig;
use liquidity_regimes::data::{InMemorySource, SourceRegistry};
use liquidity_regimes::types::Observation;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;
use std::path::Path;
use std::sync::Arc;

pub const SOURCE: &str = "mem";
pub const WEEKS: usize = 160;

/// Pipeline over four in-memory series; `bank_reserves` is non-critical and
/// feeds no composite
pub fn config_toml(data_dir: &Path) -> String {
    format!(
        r#"
data_dir = "{dir}"

[units]
scale = "billions"
currency = "USD"

[calendar]
frequency = "weekly"
anchor = "Wed"
version = "weekly-wed-v1"

[sources.{source}]
kind = "csv_dir"
path = "{dir}/upstream"

[[series]]
name = "fed_assets"
upstream_id = "WALCL"
source = "{source}"
measure = {{ kind = "amount", scale = "millions", currency = "USD" }}

[[series]]
name = "reverse_repo"
upstream_id = "RRPONTSYD"
source = "{source}"
measure = {{ kind = "amount", scale = "billions", currency = "USD" }}

[[series]]
name = "tga"
upstream_id = "WTREGEN"
source = "{source}"
measure = {{ kind = "amount", scale = "millions", currency = "USD" }}

[[series]]
name = "bank_reserves"
upstream_id = "WRESBAL"
source = "{source}"
critical = false
measure = {{ kind = "amount", scale = "billions", currency = "USD" }}

[net_liquidity]
assets = "fed_assets"
reverse_repo = "reverse_repo"
treasury_account = "tga"

[features]
zscore_window = 8
min_periods = 4

[model]
n_regimes = 2
seed = 7

[model.gmm]
n_init = 1

[model.hmm]
n_tries = 2
max_iter = 50

[fetch]
max_retries = 2
backoff_ms = 0
timeout_secs = 5
"#,
        dir = data_dir.display(),
        source = SOURCE
    )
}

pub fn config(data_dir: &Path) -> PipelineConfig {
    PipelineConfig::from_toml_str(&config_toml(data_dir)).unwrap()
}

pub fn first_week() -> NaiveDate {
    // A Wednesday
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
}

pub fn week(i: usize) -> NaiveDate {
    first_week() + Duration::weeks(i as i64)
}

/// Weekly observations for one upstream id, with 40-week liquidity blocks
pub fn synthetic(upstream_id: &str, weeks: std::ops::Range<usize>) -> Vec<Observation> {
    let seed = upstream_id.bytes().map(u64::from).sum::<u64>();
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let mut observations = Vec::new();
    for i in 0..weeks.end {
        let z = noise.sample(&mut rng);
        if i < weeks.start {
            continue;
        }
        let value = match upstream_id {
            "WALCL" => {
                let level = if (i / 40) % 2 == 0 { 300_000.0 } else { -300_000.0 };
                7_000_000.0 + level + 20_000.0 * z
            }
            "RRPONTSYD" => 500.0 + 10.0 * z,
            "WTREGEN" => 700_000.0 + 20_000.0 * z,
            _ => 3_000.0 + 50.0 * z,
        };
        observations.push(Observation::new(week(i), value));
    }
    observations
}

pub const UPSTREAM_IDS: [&str; 4] = ["WALCL", "RRPONTSYD", "WTREGEN", "WRESBAL"];

/// Source preloaded with `weeks` of history for every series
pub fn source(weeks: usize) -> Arc<InMemorySource> {
    let source = Arc::new(InMemorySource::new(SOURCE));
    for id in UPSTREAM_IDS {
        source.set_series(id, synthetic(id, 0..weeks));
    }
    source
}

pub fn registry(source: &Arc<InMemorySource>) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    registry.register_shared(SOURCE.to_string(), source.clone());
    registry
}
