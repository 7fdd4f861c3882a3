//! Error types for the liquidity regime pipeline

use crate::pipeline::stage::Stage;
use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the liquidity regime pipeline
#[derive(Error, Debug)]
pub enum LiquidityError {
    #[error("Transient upstream error for series {series}: {message}")]
    TransientUpstream { series: String, message: String },

    #[error("Permanent upstream error for series {series}: {message}")]
    PermanentUpstream { series: String, message: String },

    #[error("Data quality error in series {series}{}: {message}", at_timestamp(.timestamp))]
    DataQuality {
        series: String,
        timestamp: Option<NaiveDate>,
        message: String,
    },

    #[error("Unit mismatch for series {series}: expected {expected}, found {found}")]
    UnitMismatch {
        series: String,
        expected: String,
        found: String,
    },

    #[error("Model fit error ({model}): {message}")]
    ModelFit { model: String, message: String },

    #[error("Insufficient data for {model}: {observations} distinct observations for {components} components")]
    InsufficientData {
        model: String,
        observations: usize,
        components: usize,
    },

    #[error("Singular covariance in {model} component {component}")]
    SingularCovariance { model: String, component: usize },

    #[error("Consistency error for series {series}: ledger cursor {cursor} is ahead of stored data ({stored})")]
    Consistency {
        series: String,
        cursor: NaiveDate,
        stored: String,
    },

    #[error("Another cycle is in progress (lock held at {0})")]
    CycleInProgress(PathBuf),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<LiquidityError>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] rusqlite::Error),

    #[error("Export error: {0}")]
    ExportError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

fn at_timestamp(timestamp: &Option<NaiveDate>) -> String {
    match timestamp {
        Some(ts) => format!(" at {}", ts),
        None => String::new(),
    }
}

impl LiquidityError {
    /// Whether a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            LiquidityError::TransientUpstream { .. } => true,
            LiquidityError::Stage { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the upstream source itself failed, as opposed to returning
    /// data that did not validate
    pub fn is_upstream(&self) -> bool {
        match self {
            LiquidityError::TransientUpstream { .. } | LiquidityError::PermanentUpstream { .. } => true,
            LiquidityError::Stage { source, .. } => source.is_upstream(),
            _ => false,
        }
    }

    /// The underlying error, without stage tags
    pub fn root(&self) -> &LiquidityError {
        match self {
            LiquidityError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Tag this error with the pipeline stage it escaped from.
    ///
    /// Already-tagged errors keep their original stage.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            tagged @ LiquidityError::Stage { .. } => tagged,
            other => LiquidityError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage the error was raised in, if it was tagged
    pub fn stage(&self) -> Option<Stage> {
        match self {
            LiquidityError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Series the error refers to, if any
    pub fn series(&self) -> Option<&str> {
        match self {
            LiquidityError::TransientUpstream { series, .. }
            | LiquidityError::PermanentUpstream { series, .. }
            | LiquidityError::DataQuality { series, .. }
            | LiquidityError::UnitMismatch { series, .. }
            | LiquidityError::Consistency { series, .. } => Some(series),
            LiquidityError::Stage { source, .. } => source.series(),
            _ => None,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            LiquidityError::Stage { source, .. } => source.exit_code(),
            LiquidityError::Consistency { .. } => 2,
            LiquidityError::CycleInProgress(_) => 3,
            LiquidityError::ConfigError(_) => 4,
            _ => 1,
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, LiquidityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_tagging_is_idempotent() {
        let err = LiquidityError::ModelFit {
            model: "hmm".to_string(),
            message: "diverged".to_string(),
        };
        let tagged = err.in_stage(Stage::Retrain).in_stage(Stage::Commit);
        assert_eq!(tagged.stage(), Some(Stage::Retrain));
        assert!(tagged.to_string().contains("RETRAIN"));
        assert!(tagged.to_string().contains("diverged"));
    }

    #[test]
    fn test_transient_classification_through_stage() {
        let err = LiquidityError::TransientUpstream {
            series: "WALCL".to_string(),
            message: "timeout".to_string(),
        }
        .in_stage(Stage::Fetch);
        assert!(err.is_transient());
        assert_eq!(err.series(), Some("WALCL"));
    }

    #[test]
    fn test_upstream_classification_and_root() {
        let permanent = LiquidityError::PermanentUpstream {
            series: "WALCL".to_string(),
            message: "HTTP 404".to_string(),
        };
        assert!(permanent.is_upstream());

        let quality = LiquidityError::DataQuality {
            series: "fed_assets".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 6),
            message: "non-finite value NaN".to_string(),
        }
        .in_stage(Stage::Transform);
        assert!(!quality.is_upstream());
        assert!(matches!(quality.root(), LiquidityError::DataQuality { .. }));
    }

    #[test]
    fn test_data_quality_message_includes_timestamp() {
        let err = LiquidityError::DataQuality {
            series: "RRPONTSYD".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 6),
            message: "non-monotonic timestamps".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("RRPONTSYD"));
        assert!(msg.contains("2024-03-06"));
    }

    #[test]
    fn test_exit_codes() {
        let consistency = LiquidityError::Consistency {
            series: "WTREGEN".to_string(),
            cursor: NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            stored: "none".to_string(),
        };
        assert_eq!(consistency.exit_code(), 2);
        assert_eq!(
            LiquidityError::CycleInProgress(PathBuf::from("/tmp/x.lock")).exit_code(),
            3
        );
        assert_eq!(
            LiquidityError::DataError("x".to_string())
                .in_stage(Stage::Transform)
                .exit_code(),
            1
        );
    }
}
