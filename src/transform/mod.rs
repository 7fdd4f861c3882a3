//! Transform layer
//!
//! Pure mapping from the full raw history of every configured series to
//! the composite series and the model feature matrix. Always recomputed
//! over the full history, so a late correction to an old point reaches
//! every composite value after it.

pub mod align;
pub mod composite;
pub mod features;
pub mod merge;
pub mod units;

pub use align::{forward_fill, session_grid, AlignedPoint, AlignedSeries};
pub use composite::{net_liquidity, weighted_index};
pub use features::{build_features, FeatureMatrix};
pub use merge::{merge_staged, Conflict, MergeOutcome};

use crate::calendar::ReportingCalendar;
use crate::config::{Currency, Measure, PipelineConfig, GLOBAL_LIQUIDITY_INDEX, NET_LIQUIDITY};
use crate::error::{LiquidityError, Result};
use crate::types::{CompositeSeries, Series, Timestamp};
use hashbrown::HashMap;
use log::{debug, info, warn};
use serde_json::json;

/// Composites and features produced from one history snapshot
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub composites: Vec<CompositeSeries>,
    pub features: FeatureMatrix,
}

impl TransformOutput {
    pub fn composite(&self, name: &str) -> Option<&CompositeSeries> {
        self.composites.iter().find(|c| c.name == name)
    }
}

struct Transformer<'a> {
    config: &'a PipelineConfig,
    calendar: &'a dyn ReportingCalendar,
    history: &'a HashMap<String, Series>,
    sessions: Vec<Timestamp>,
}

impl<'a> Transformer<'a> {
    fn series(&self, name: &str) -> Result<&'a Series> {
        match self.history.get(name) {
            Some(series) if !series.is_empty() => Ok(series),
            _ => Err(LiquidityError::DataQuality {
                series: name.to_string(),
                timestamp: None,
                message: "no observations available".to_string(),
            }),
        }
    }

    fn measure(&self, name: &str) -> Result<Measure> {
        self.config
            .series_config(name)
            .map(|s| s.measure)
            .ok_or_else(|| LiquidityError::ConfigError(format!("unknown series '{}'", name)))
    }

    /// Rescale to the target scale and align onto the session grid
    fn aligned_amount(&self, name: &str) -> Result<(AlignedSeries, Currency)> {
        let series = self.series(name)?;
        let (scaled, currency) = units::rescale_amount(series, &self.measure(name)?, self.config.units.scale)?;
        let aligned = forward_fill(&scaled, &self.sessions, self.config.calendar.max_staleness_days);
        debug!(
            "Aligned {}: {} sessions, {} carried forward",
            name,
            aligned.len(),
            aligned.filled_count()
        );
        Ok((aligned, currency))
    }

    fn aligned_target_amount(&self, name: &str) -> Result<AlignedSeries> {
        let (aligned, currency) = self.aligned_amount(name)?;
        units::require_currency(name, currency, &self.config.units)?;
        Ok(aligned)
    }

    fn calendar_record(&self) -> serde_json::Value {
        json!({
            "calendar": self.calendar.describe(),
            "calendar_version": self.calendar.version(),
            "max_staleness_days": self.config.calendar.max_staleness_days,
            "units": {
                "scale": self.config.units.scale.as_str(),
                "currency": self.config.units.currency.to_string(),
            },
        })
    }

    fn net_liquidity(&self) -> Result<CompositeSeries> {
        let nl = &self.config.net_liquidity;
        let assets = self.aligned_target_amount(&nl.assets)?;
        let reverse_repo = self.aligned_target_amount(&nl.reverse_repo)?;
        let treasury = self.aligned_target_amount(&nl.treasury_account)?;

        let points = composite::net_liquidity(&assets, &reverse_repo, &treasury)?;
        let mut parameters = self.calendar_record();
        parameters["formula"] = json!(format!(
            "{} - {} - {}",
            nl.assets, nl.reverse_repo, nl.treasury_account
        ));

        Ok(CompositeSeries {
            name: NET_LIQUIDITY.to_string(),
            parameters,
            points,
        })
    }

    fn global_liquidity_index(&self, net_liquidity: &CompositeSeries) -> Result<Option<CompositeSeries>> {
        let gli = match &self.config.gli {
            Some(gli) => gli,
            None => return Ok(None),
        };

        let mut regions: Vec<(String, AlignedSeries)> = Vec::with_capacity(gli.regions.len());
        for region in &gli.regions {
            if region.series == NET_LIQUIDITY {
                let values = self
                    .sessions
                    .iter()
                    .map(|ts| net_liquidity.get(*ts))
                    .collect();
                regions.push((
                    region.name.clone(),
                    AlignedSeries::from_values(NET_LIQUIDITY, &self.sessions, values),
                ));
                continue;
            }

            // A region without any committed data leaves the index out of this cycle
            let has_data = |name: &str| self.history.get(name).map_or(false, |s| !s.is_empty());
            if !has_data(&region.series) || region.fx.as_deref().map_or(false, |fx| !has_data(fx)) {
                warn!(
                    "Region {} has no data yet; {} not built this cycle",
                    region.name, GLOBAL_LIQUIDITY_INDEX
                );
                return Ok(None);
            }

            let (aligned, currency) = self.aligned_amount(&region.series)?;
            let converted = match (&region.fx, currency == self.config.units.currency) {
                (None, true) => aligned,
                (None, false) => {
                    return Err(LiquidityError::UnitMismatch {
                        series: region.series.clone(),
                        expected: self.config.units.currency.to_string(),
                        found: format!("{} without an fx series", currency),
                    })
                }
                (Some(fx), _) => {
                    let fx_series = self.series(fx)?;
                    let fx_aligned = forward_fill(fx_series, &self.sessions, self.config.calendar.max_staleness_days);
                    units::convert_currency(
                        &aligned,
                        currency,
                        self.config.units.currency,
                        &fx_aligned,
                        &self.measure(fx)?,
                    )?
                }
            };
            regions.push((region.name.clone(), converted));
        }

        let inputs: Vec<(&str, &AlignedSeries)> = regions.iter().map(|(n, s)| (n.as_str(), s)).collect();
        let points = composite::weighted_index(&inputs, &gli.weighting)?;

        let mut parameters = self.calendar_record();
        parameters["gli_version"] = json!(gli.version);
        parameters["weighting"] = serde_json::to_value(&gli.weighting)?;
        parameters["regions"] = serde_json::to_value(&gli.regions)?;

        Ok(Some(CompositeSeries {
            name: GLOBAL_LIQUIDITY_INDEX.to_string(),
            parameters,
            points,
        }))
    }
}

/// Session window covering every series the composites read
fn history_window(config: &PipelineConfig, history: &HashMap<String, Series>) -> Option<(Timestamp, Timestamp)> {
    let mut names: Vec<&str> = vec![
        config.net_liquidity.assets.as_str(),
        config.net_liquidity.reverse_repo.as_str(),
        config.net_liquidity.treasury_account.as_str(),
    ];
    if let Some(gli) = &config.gli {
        for region in &gli.regions {
            if region.series != NET_LIQUIDITY {
                names.push(&region.series);
            }
            if let Some(fx) = &region.fx {
                names.push(fx);
            }
        }
    }

    let mut window: Option<(Timestamp, Timestamp)> = None;
    for name in names {
        let series = match history.get(name) {
            Some(s) => s,
            None => continue,
        };
        if let (Some(first), Some(last)) = (series.first_timestamp(), series.last_timestamp()) {
            window = Some(match window {
                Some((lo, hi)) => (lo.min(first), hi.max(last)),
                None => (first, last),
            });
        }
    }
    window
}

/// Recompute every composite and the feature matrix from the full history
pub fn run(
    config: &PipelineConfig,
    calendar: &dyn ReportingCalendar,
    history: &HashMap<String, Series>,
) -> Result<TransformOutput> {
    let (start, end) = history_window(config, history).ok_or_else(|| LiquidityError::DataQuality {
        series: config.net_liquidity.assets.clone(),
        timestamp: None,
        message: "no observations available".to_string(),
    })?;
    let sessions = session_grid(calendar, start, end)?;
    info!(
        "Transforming {} sessions ({} .. {}) on {}",
        sessions.len(),
        start,
        end,
        calendar.describe()
    );

    let transformer = Transformer {
        config,
        calendar,
        history,
        sessions,
    };

    let net_liquidity = transformer.net_liquidity()?;
    info!("{}: {} points", NET_LIQUIDITY, net_liquidity.len());

    let mut composites = vec![net_liquidity];
    if let Some(gli) = transformer.global_liquidity_index(&composites[0])? {
        info!("{}: {} points", GLOBAL_LIQUIDITY_INDEX, gli.len());
        composites.push(gli);
    }

    let feature_inputs: Vec<&CompositeSeries> = composites.iter().collect();
    let features = build_features(&feature_inputs, &config.features)?;
    debug!(
        "Feature matrix: {} rows x {} columns",
        features.n_rows(),
        features.n_features()
    );

    Ok(TransformOutput { composites, features })
}
