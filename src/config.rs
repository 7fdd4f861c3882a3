//! Pipeline configuration
//!
//! Loaded once per cycle from a TOML file and treated as read-only input.
//! The alignment calendar and the GLI weighting scheme have no defaults:
//! both are explicit, versioned parameters that are persisted with every
//! composite they produce.

use crate::error::{LiquidityError, Result};
use chrono::NaiveDate;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Reserved region input name that refers to the Net Liquidity composite
pub const NET_LIQUIDITY: &str = "net_liquidity";
/// Name of the Global Liquidity Index composite
pub const GLOBAL_LIQUIDITY_INDEX: &str = "global_liquidity_index";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub units: UnitsConfig,
    pub calendar: CalendarConfig,
    pub series: Vec<SeriesConfig>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    pub net_liquidity: NetLiquidityConfig,
    #[serde(default)]
    pub gli: Option<GliConfig>,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Magnitude of an amount series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    Units,
    Thousands,
    Millions,
    HundredMillions,
    Billions,
    Trillions,
}

impl Scale {
    /// Number of base units represented by one unit of this scale
    pub fn factor(&self) -> f64 {
        match self {
            Scale::Units => 1.0,
            Scale::Thousands => 1e3,
            Scale::Millions => 1e6,
            Scale::HundredMillions => 1e8,
            Scale::Billions => 1e9,
            Scale::Trillions => 1e12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scale::Units => "units",
            Scale::Thousands => "thousands",
            Scale::Millions => "millions",
            Scale::HundredMillions => "hundred_millions",
            Scale::Billions => "billions",
            Scale::Trillions => "trillions",
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    USD,
    EUR,
    JPY,
    GBP,
    CHF,
    CNY,
    CAD,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::JPY => "JPY",
            Currency::GBP => "GBP",
            Currency::CHF => "CHF",
            Currency::CNY => "CNY",
            Currency::CAD => "CAD",
        };
        write!(f, "{}", code)
    }
}

/// Common unit every amount is normalised to before arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitsConfig {
    pub scale: Scale,
    pub currency: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarFrequency {
    Weekly,
    Business,
    Daily,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub frequency: CalendarFrequency,
    /// Anchor weekday for weekly calendars ("Wed")
    #[serde(default)]
    pub anchor: Option<String>,
    pub version: String,
    /// Forward-filled values older than this many days count as missing
    #[serde(default)]
    pub max_staleness_days: Option<u32>,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

/// What a series measures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measure {
    /// Monetary stock, e.g. a balance-sheet line
    Amount { scale: Scale, currency: Currency },
    /// Exchange rate: quote units per one unit of base
    FxRate { base: Currency, quote: Currency },
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measure::Amount { scale, currency } => write!(f, "{} {}", currency, scale),
            Measure::FxRate { base, quote } => write!(f, "{} per {}", quote, base),
        }
    }
}

/// Static mapping from logical series name to upstream identifier and unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesConfig {
    pub name: String,
    pub upstream_id: String,
    pub source: String,
    pub measure: Measure,
    /// A failing critical series aborts the cycle; others are logged as degraded
    #[serde(default = "default_true")]
    pub critical: bool,
    /// Lower bound for the first backfill
    #[serde(default)]
    pub start: Option<NaiveDate>,
}

fn default_true() -> bool {
    true
}

/// Upstream source definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Directory of `<upstream_id>.csv` files with `date,value` columns
    CsvDir { path: PathBuf },
    /// FRED observations API
    Fred {
        #[serde(default = "default_fred_key_env")]
        api_key_env: String,
        #[serde(default)]
        base_url: Option<String>,
    },
}

fn default_fred_key_env() -> String {
    "FRED_API_KEY".to_string()
}

/// Net Liquidity = assets - reverse_repo - treasury_account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetLiquidityConfig {
    pub assets: String,
    pub reverse_repo: String,
    pub treasury_account: String,
}

/// Regional weighting of the Global Liquidity Index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum Weighting {
    /// Unit weights: the index is the sum of regional values
    Sum,
    /// 1/n per region
    Equal,
    /// Explicit per-region weights
    Fixed { weights: BTreeMap<String, f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    /// Amount series name, or `net_liquidity`
    pub series: String,
    /// FX-rate series connecting the region's currency to the target currency
    #[serde(default)]
    pub fx: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GliConfig {
    pub version: String,
    pub weighting: Weighting,
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Rolling window (in calendar sessions) of the z-score features
    #[serde(default = "default_zscore_window")]
    pub zscore_window: usize,
    /// Minimum observations in a window before a z-score is emitted
    #[serde(default)]
    pub min_periods: Option<usize>,
}

fn default_zscore_window() -> usize {
    52
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            zscore_window: default_zscore_window(),
            min_periods: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceType {
    Full,
    Diagonal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialDistribution {
    Estimated,
    Uniform,
}

/// How regime indices are made comparable across refits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelAlignment {
    /// Rank by descending mean of the ordering features (0 = most expansive)
    Ranked,
    /// Match centroids of the previous committed fit, ranking when none exists
    PreviousFit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmmConfig {
    #[serde(default = "default_full")]
    pub covariance: CovarianceType,
    #[serde(default = "default_n_init")]
    pub n_init: usize,
    #[serde(default = "default_gmm_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_tol")]
    pub tol: f64,
    #[serde(default = "default_reg_covar")]
    pub reg_covar: f64,
}

fn default_full() -> CovarianceType {
    CovarianceType::Full
}
fn default_n_init() -> usize {
    5
}
fn default_gmm_max_iter() -> usize {
    200
}
fn default_tol() -> f64 {
    1e-4
}
fn default_reg_covar() -> f64 {
    1e-6
}

impl Default for GmmConfig {
    fn default() -> Self {
        Self {
            covariance: default_full(),
            n_init: default_n_init(),
            max_iter: default_gmm_max_iter(),
            tol: default_tol(),
            reg_covar: default_reg_covar(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmmConfig {
    #[serde(default = "default_diagonal")]
    pub covariance: CovarianceType,
    #[serde(default = "default_n_tries")]
    pub n_tries: usize,
    #[serde(default = "default_hmm_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_tol")]
    pub tol: f64,
    #[serde(default = "default_min_covar")]
    pub min_covar: f64,
    #[serde(default = "default_transition_smoothing")]
    pub transition_smoothing: f64,
    #[serde(default = "default_initial")]
    pub initial: InitialDistribution,
}

fn default_diagonal() -> CovarianceType {
    CovarianceType::Diagonal
}
fn default_n_tries() -> usize {
    10
}
fn default_hmm_max_iter() -> usize {
    500
}
fn default_min_covar() -> f64 {
    1e-2
}
fn default_transition_smoothing() -> f64 {
    1e-3
}
fn default_initial() -> InitialDistribution {
    InitialDistribution::Estimated
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            covariance: default_diagonal(),
            n_tries: default_n_tries(),
            max_iter: default_hmm_max_iter(),
            tol: default_tol(),
            min_covar: default_min_covar(),
            transition_smoothing: default_transition_smoothing(),
            initial: default_initial(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_n_regimes")]
    pub n_regimes: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_alignment")]
    pub alignment: LabelAlignment,
    /// Feature columns whose means rank regimes; empty = all level z-scores
    #[serde(default)]
    pub ordering_features: Vec<String>,
    /// Cholesky pivots at or below this value mark a covariance singular
    #[serde(default = "default_singular_tolerance")]
    pub singular_tolerance: f64,
    #[serde(default)]
    pub gmm: GmmConfig,
    #[serde(default)]
    pub hmm: HmmConfig,
}

fn default_n_regimes() -> usize {
    3
}
fn default_seed() -> u64 {
    42
}
fn default_alignment() -> LabelAlignment {
    LabelAlignment::Ranked
}
fn default_singular_tolerance() -> f64 {
    1e-12
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_regimes: default_n_regimes(),
            seed: default_seed(),
            alignment: default_alignment(),
            ordering_features: Vec::new(),
            singular_tolerance: default_singular_tolerance(),
            gmm: GmmConfig::default(),
            hmm: HmmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            LiquidityError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(contents)
            .map_err(|e| LiquidityError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a series definition by logical name
    pub fn series_config(&self, name: &str) -> Option<&SeriesConfig> {
        self.series.iter().find(|s| s.name == name)
    }

    /// SQLite file holding the series store, ledger and artifacts
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("liquidity.sqlite")
    }

    /// Cycle lock file
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("liquidity.lock")
    }

    /// Directory for Parquet/CSV exports
    pub fn export_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }

    /// Reject configurations that cannot produce a consistent cycle
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(LiquidityError::ConfigError(msg));

        if self.series.is_empty() {
            return err("no series configured".to_string());
        }

        let mut names = HashSet::new();
        for series in &self.series {
            if series.name == NET_LIQUIDITY || series.name == GLOBAL_LIQUIDITY_INDEX {
                return err(format!("series name '{}' is reserved", series.name));
            }
            if !names.insert(series.name.as_str()) {
                return err(format!("duplicate series name '{}'", series.name));
            }
            if !self.sources.contains_key(&series.source) {
                return err(format!(
                    "series '{}' refers to unknown source '{}'",
                    series.name, series.source
                ));
            }
        }

        for input in [
            &self.net_liquidity.assets,
            &self.net_liquidity.reverse_repo,
            &self.net_liquidity.treasury_account,
        ] {
            if !names.contains(input.as_str()) {
                return err(format!("net liquidity input '{}' is not a configured series", input));
            }
        }

        if self.calendar.version.trim().is_empty() {
            return err("calendar.version must be set".to_string());
        }

        if let Some(gli) = &self.gli {
            if gli.version.trim().is_empty() {
                return err("gli.version must be set".to_string());
            }
            if gli.regions.is_empty() {
                return err("gli has no regions".to_string());
            }
            let mut regions = HashSet::new();
            for region in &gli.regions {
                if !regions.insert(region.name.as_str()) {
                    return err(format!("duplicate gli region '{}'", region.name));
                }
                if region.series != NET_LIQUIDITY && !names.contains(region.series.as_str()) {
                    return err(format!(
                        "gli region '{}' refers to unknown series '{}'",
                        region.name, region.series
                    ));
                }
                if let Some(fx) = &region.fx {
                    if !names.contains(fx.as_str()) {
                        return err(format!(
                            "gli region '{}' refers to unknown fx series '{}'",
                            region.name, fx
                        ));
                    }
                }
            }
            if let Weighting::Fixed { weights } = &gli.weighting {
                for region in &gli.regions {
                    match weights.get(&region.name) {
                        Some(w) if w.is_finite() => {}
                        Some(w) => return err(format!("non-finite weight {} for region '{}'", w, region.name)),
                        None => return err(format!("no weight for gli region '{}'", region.name)),
                    }
                }
                if let Some(extra) = weights.keys().find(|k| !regions.contains(k.as_str())) {
                    return err(format!("weight given for unknown gli region '{}'", extra));
                }
            }
        }

        if self.features.zscore_window < 2 {
            return err("features.zscore_window must be at least 2".to_string());
        }
        if self.model.n_regimes < 1 {
            return err("model.n_regimes must be at least 1".to_string());
        }
        if self.model.n_regimes > 8 && self.model.alignment == LabelAlignment::PreviousFit {
            return err("previous_fit alignment supports at most 8 regimes".to_string());
        }
        if self.model.gmm.n_init == 0 || self.model.hmm.n_tries == 0 {
            return err("model restarts (gmm.n_init, hmm.n_tries) must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
data_dir = "/tmp/liquidity"

[units]
scale = "billions"
currency = "USD"

[calendar]
frequency = "weekly"
anchor = "Wed"
version = "weekly-wed-v1"

[sources.local]
kind = "csv_dir"
path = "/tmp/upstream"

[[series]]
name = "fed_assets"
upstream_id = "WALCL"
source = "local"
measure = { kind = "amount", scale = "millions", currency = "USD" }

[[series]]
name = "reverse_repo"
upstream_id = "RRPONTSYD"
source = "local"
measure = { kind = "amount", scale = "billions", currency = "USD" }

[[series]]
name = "tga"
upstream_id = "WTREGEN"
source = "local"
measure = { kind = "amount", scale = "millions", currency = "USD" }

[[series]]
name = "ecb_assets"
upstream_id = "ECBASSETSW"
source = "local"
critical = false
measure = { kind = "amount", scale = "millions", currency = "EUR" }

[[series]]
name = "usd_per_eur"
upstream_id = "DEXUSEU"
source = "local"
critical = false
measure = { kind = "fx_rate", base = "EUR", quote = "USD" }

[net_liquidity]
assets = "fed_assets"
reverse_repo = "reverse_repo"
treasury_account = "tga"

[gli]
version = "gli-v1"
weighting = { scheme = "sum" }

[[gli.regions]]
name = "us"
series = "net_liquidity"

[[gli.regions]]
name = "ea"
series = "ecb_assets"
fx = "usd_per_eur"

[model]
n_regimes = 2
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.series.len(), 5);
        assert_eq!(config.units.scale, Scale::Billions);
        assert_eq!(config.model.n_regimes, 2);
        assert_eq!(config.model.hmm.covariance, CovarianceType::Diagonal);
        assert!(!config.series_config("ecb_assets").unwrap().critical);
        assert!(config.series_config("fed_assets").unwrap().critical);
        assert_eq!(
            config.series_config("usd_per_eur").unwrap().measure,
            Measure::FxRate {
                base: Currency::EUR,
                quote: Currency::USD
            }
        );
        assert_eq!(config.gli.as_ref().unwrap().weighting, Weighting::Sum);
        assert_eq!(config.store_path(), PathBuf::from("/tmp/liquidity/liquidity.sqlite"));
    }

    #[test]
    fn test_calendar_is_mandatory() {
        let without_calendar = SAMPLE.replace(
            "[calendar]\nfrequency = \"weekly\"\nanchor = \"Wed\"\nversion = \"weekly-wed-v1\"\n",
            "",
        );
        assert!(PipelineConfig::from_toml_str(&without_calendar).is_err());
    }

    #[test]
    fn test_unknown_net_liquidity_input_rejected() {
        let broken = SAMPLE.replace("treasury_account = \"tga\"", "treasury_account = \"tgax\"");
        let err = PipelineConfig::from_toml_str(&broken).unwrap_err();
        assert!(err.to_string().contains("tgax"));
    }

    #[test]
    fn test_fixed_weights_must_cover_regions() {
        let broken = SAMPLE.replace(
            "weighting = { scheme = \"sum\" }",
            "weighting = { scheme = \"fixed\", weights = { us = 0.7 } }",
        );
        let err = PipelineConfig::from_toml_str(&broken).unwrap_err();
        assert!(err.to_string().contains("ea"));
    }

    #[test]
    fn test_reserved_series_name_rejected() {
        let broken = SAMPLE.replace("name = \"tga\"", "name = \"net_liquidity\"");
        assert!(PipelineConfig::from_toml_str(&broken).is_err());
    }
}
