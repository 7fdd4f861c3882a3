//! Unit and currency normalisation
//!
//! Amounts are rescaled to the configured target scale before any
//! arithmetic. Currency conversion only happens through an explicit FX-rate
//! series; a currency that cannot be reconciled is a hard error.

use super::align::{AlignedPoint, AlignedSeries};
use crate::config::{Currency, Measure, Scale, UnitsConfig};
use crate::error::{LiquidityError, Result};
use crate::types::{Series, SeriesPoint};

/// Rescale an amount series to `target` scale, returning it with its currency
pub fn rescale_amount(series: &Series, measure: &Measure, target: Scale) -> Result<(Series, Currency)> {
    let (scale, currency) = match measure {
        Measure::Amount { scale, currency } => (*scale, *currency),
        Measure::FxRate { .. } => {
            return Err(LiquidityError::UnitMismatch {
                series: series.id().to_string(),
                expected: format!("an amount in {}", target),
                found: measure.to_string(),
            })
        }
    };

    let factor = scale.factor() / target.factor();
    if factor == 1.0 {
        return Ok((series.clone(), currency));
    }

    let points: Vec<SeriesPoint> = series
        .points()
        .iter()
        .map(|p| SeriesPoint {
            value: p.value * factor,
            ..p.clone()
        })
        .collect();
    Ok((Series::from_points(series.id(), points)?, currency))
}

/// Reject an amount whose currency is not the target currency
pub fn require_currency(series: &str, currency: Currency, units: &UnitsConfig) -> Result<()> {
    if currency != units.currency {
        return Err(LiquidityError::UnitMismatch {
            series: series.to_string(),
            expected: format!("{} {}", units.currency, units.scale),
            found: format!("{} {}", currency, units.scale),
        });
    }
    Ok(())
}

/// Convert an aligned amount from `from` into `to` using an aligned FX series.
///
/// The FX series quotes `quote` units per one `base`. Sessions where either
/// the amount or the rate is missing stay missing.
pub fn convert_currency(
    amount: &AlignedSeries,
    from: Currency,
    to: Currency,
    fx: &AlignedSeries,
    fx_measure: &Measure,
) -> Result<AlignedSeries> {
    let (base, quote) = match fx_measure {
        Measure::FxRate { base, quote } => (*base, *quote),
        Measure::Amount { .. } => {
            return Err(LiquidityError::UnitMismatch {
                series: fx.name.clone(),
                expected: format!("an exchange rate between {} and {}", from, to),
                found: fx_measure.to_string(),
            })
        }
    };

    // amount[from] * rate = amount[to] when the rate quotes `to` per `from`
    let multiply = if base == from && quote == to {
        true
    } else if base == to && quote == from {
        false
    } else {
        return Err(LiquidityError::UnitMismatch {
            series: fx.name.clone(),
            expected: format!("{} per {} (or its inverse)", to, from),
            found: fx_measure.to_string(),
        });
    };

    if amount.len() != fx.len() {
        return Err(LiquidityError::DataError(format!(
            "{} and {} are not aligned on the same calendar",
            amount.name, fx.name
        )));
    }

    let mut points = Vec::with_capacity(amount.len());
    for (a, r) in amount.points.iter().zip(&fx.points) {
        if a.timestamp != r.timestamp {
            return Err(LiquidityError::DataError(format!(
                "{} and {} are not aligned on the same calendar",
                amount.name, fx.name
            )));
        }
        let value = match (a.value, r.value) {
            (Some(v), Some(rate)) if rate > 0.0 && rate.is_finite() => {
                Some(if multiply { v * rate } else { v / rate })
            }
            (Some(_), Some(rate)) => {
                return Err(LiquidityError::DataQuality {
                    series: fx.name.clone(),
                    timestamp: Some(a.timestamp),
                    message: format!("invalid exchange rate {}", rate),
                })
            }
            _ => None,
        };
        points.push(AlignedPoint {
            timestamp: a.timestamp,
            value,
            source_timestamp: a.source_timestamp,
        });
    }

    Ok(AlignedSeries {
        name: amount.name.clone(),
        points,
    })
}
