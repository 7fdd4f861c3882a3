//! Columnar export of committed outputs
//!
//! Everything here is regenerated from the store, so an export can be
//! repeated at any time without touching cycle state.
//!
//! - composites: `<name>.parquet` / `<name>.csv` with `date,value`
//! - regime labels: `regimes_<model>.parquet` / `.csv` with `date,regime,p_regime_<k>...`
//! - HMM transition matrix: `transition_matrix.csv`, rows `from_regime_i`,
//!   columns `to_regime_j`, plus the expected duration of each regime

use crate::data::store::SeriesStore;
use crate::error::{LiquidityError, Result};
use crate::regime::{gmm, hmm, FittedModel, HmmParams};
use crate::types::{CompositeSeries, RegimeLabelSeries};
use log::{info, warn};
use polars::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const TRANSITION_MATRIX_FILE: &str = "transition_matrix.csv";

fn export_error(e: impl std::fmt::Display) -> LiquidityError {
    LiquidityError::ExportError(e.to_string())
}

/// Files written by one export
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub files: Vec<PathBuf>,
}

/// Write a frame as Parquet and CSV next to each other
fn write_frame(df: &mut DataFrame, dir: &Path, stem: &str, summary: &mut ExportSummary) -> Result<()> {
    let parquet_path = dir.join(format!("{}.parquet", stem));
    let file = File::create(&parquet_path)?;
    ParquetWriter::new(file).finish(df).map_err(export_error)?;
    summary.files.push(parquet_path);

    let csv_path = dir.join(format!("{}.csv", stem));
    let mut file = File::create(&csv_path)?;
    CsvWriter::new(&mut file).finish(df).map_err(export_error)?;
    summary.files.push(csv_path);
    Ok(())
}

/// Frame with one row per composite point
pub fn composite_frame(composite: &CompositeSeries) -> Result<DataFrame> {
    let dates: Vec<String> = composite.points.iter().map(|p| p.timestamp.to_string()).collect();
    let values: Vec<f64> = composite.points.iter().map(|p| p.value).collect();
    df![
        "date" => dates,
        "value" => values,
    ]
    .map_err(export_error)
}

/// Frame with one row per labelled timestamp and one posterior column per regime
pub fn label_frame(labels: &RegimeLabelSeries) -> Result<DataFrame> {
    let n_regimes = labels.labels.first().map_or(0, |l| l.probabilities.len());
    let mut columns = vec![
        Series::new(
            "date",
            labels.labels.iter().map(|l| l.timestamp.to_string()).collect::<Vec<_>>(),
        ),
        Series::new(
            "regime",
            labels.labels.iter().map(|l| l.regime as u32).collect::<Vec<_>>(),
        ),
    ];
    for k in 0..n_regimes {
        let probs: Vec<f64> = labels
            .labels
            .iter()
            .map(|l| l.probabilities.get(k).copied().unwrap_or(f64::NAN))
            .collect();
        columns.push(Series::new(&format!("p_regime_{}", k), probs));
    }
    DataFrame::new(columns).map_err(export_error)
}

/// Write the transition matrix of a fitted HMM as CSV
pub fn write_transition_matrix(params: &HmmParams, path: &Path) -> Result<()> {
    let k = params.transition.len();
    let mut writer = csv::Writer::from_path(path).map_err(export_error)?;

    let mut header = vec!["from_regime".to_string()];
    header.extend((0..k).map(|j| format!("to_regime_{}", j)));
    header.push("expected_duration".to_string());
    writer.write_record(&header).map_err(export_error)?;

    for (i, row) in params.transition.iter().enumerate() {
        let mut record = vec![format!("from_regime_{}", i)];
        record.extend(row.iter().map(|p| p.to_string()));
        record.push(
            params
                .expected_durations
                .get(i)
                .copied()
                .flatten()
                .map_or_else(|| "inf".to_string(), |d| d.to_string()),
        );
        writer.write_record(&record).map_err(export_error)?;
    }
    writer.flush()?;
    Ok(())
}

/// Export every committed composite, label series and the latest HMM
/// transition matrix into `dir`
pub fn export_all(store: &SeriesStore, dir: &Path) -> Result<ExportSummary> {
    fs::create_dir_all(dir)?;
    let mut summary = ExportSummary::default();

    for name in store.composite_names()? {
        if let Some(composite) = store.load_composite(&name)? {
            let mut df = composite_frame(&composite)?;
            write_frame(&mut df, dir, &name, &mut summary)?;
        }
    }

    for model in [gmm::MODEL_NAME, hmm::MODEL_NAME] {
        match store.load_labels(model)? {
            Some(labels) => {
                let mut df = label_frame(&labels)?;
                write_frame(&mut df, dir, &format!("regimes_{}", model), &mut summary)?;
            }
            None => warn!("No committed {} labels to export", model),
        }
    }

    if let Some(stored) = store.latest_artifact(hmm::MODEL_NAME)? {
        let fitted: FittedModel<HmmParams> = FittedModel::from_artifact(&stored.artifact)?;
        let path = dir.join(TRANSITION_MATRIX_FILE);
        write_transition_matrix(&fitted.params, &path)?;
        summary.files.push(path);
    }

    info!("Exported {} files to {}", summary.files.len(), dir.display());
    Ok(summary)
}
