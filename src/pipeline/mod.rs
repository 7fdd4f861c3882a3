//! Update cycle: stage state machine, cycle lock and orchestrator

pub mod lock;
pub mod orchestrator;
pub mod stage;

pub use lock::CycleLock;
pub use orchestrator::{CycleMode, CycleReport, SeriesReport, StagedSeries, UpdateOrchestrator};
pub use stage::{CycleState, Stage, StageMachine};
