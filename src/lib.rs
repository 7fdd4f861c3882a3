//! # Liquidity Regimes
//!
//! An incremental pipeline that ingests central-bank balance-sheet series,
//! builds Net Liquidity and a Global Liquidity Index on a versioned
//! reporting calendar, and labels every week with a liquidity regime using
//! a Gaussian mixture and a Gaussian hidden Markov model.
//!
//! Each update cycle runs `FETCH -> CLEAN/TRANSFORM -> RETRAIN -> COMMIT`
//! and either commits all of its outputs or none of them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use liquidity_regimes::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let config = PipelineConfig::load(std::path::Path::new("liquidity.toml"))?;
//!     let sources = SourceRegistry::from_config(&config)?;
//!     let mut orchestrator = UpdateOrchestrator::open(config, sources)?;
//!     let report = orchestrator.run_cycle(CycleMode::Incremental)?;
//!     println!("committed cycle {}", report.cycle_id);
//!     Ok(())
//! }
//! ```

pub mod calendar;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod regime;
pub mod transform;
pub mod types;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::calendar::ReportingCalendar;
    pub use crate::config::PipelineConfig;
    pub use crate::data::{InMemorySource, SeriesStore, SourceRegistry, UpstreamSource};
    pub use crate::error::{LiquidityError, Result};
    pub use crate::pipeline::{CycleMode, CycleReport, Stage, UpdateOrchestrator};
    pub use crate::regime::{GaussianHmm, GaussianMixture, RegimeEngine};
    pub use crate::types::*;
}
