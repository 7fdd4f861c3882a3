//! Cycle stages and the transitions allowed between them

use crate::error::{LiquidityError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage of an update cycle, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Fetch,
    Transform,
    Retrain,
    Commit,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Fetch, Stage::Transform, Stage::Retrain, Stage::Commit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "FETCH",
            Stage::Transform => "CLEAN/TRANSFORM",
            Stage::Retrain => "RETRAIN",
            Stage::Commit => "COMMIT",
        }
    }

    /// Stage that follows this one, `None` after COMMIT
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Fetch => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Retrain),
            Stage::Retrain => Some(Stage::Commit),
            Stage::Commit => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Running(Stage),
    Committed,
    Failed(Stage),
}

/// Enforces `FETCH -> CLEAN/TRANSFORM -> RETRAIN -> COMMIT`.
///
/// A stage may only be entered once its predecessor has completed; a
/// failure is terminal for the cycle.
#[derive(Debug, Clone)]
pub struct StageMachine {
    state: CycleState,
    completed: Vec<Stage>,
}

impl StageMachine {
    pub fn new() -> Self {
        Self {
            state: CycleState::Idle,
            completed: Vec::new(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn completed(&self) -> &[Stage] {
        &self.completed
    }

    /// Stage currently running, if any
    pub fn current(&self) -> Option<Stage> {
        match self.state {
            CycleState::Running(stage) => Some(stage),
            _ => None,
        }
    }

    /// Enter `stage`; fails unless it is the successor of the last completed stage
    pub fn enter(&mut self, stage: Stage) -> Result<()> {
        let expected = match (self.state, self.completed.last()) {
            (CycleState::Idle, None) => Some(Stage::Fetch),
            (CycleState::Idle, Some(last)) => last.next(),
            _ => None,
        };
        if expected != Some(stage) {
            return Err(LiquidityError::DataError(format!(
                "cannot enter {} from state {:?}",
                stage, self.state
            )));
        }
        self.state = CycleState::Running(stage);
        Ok(())
    }

    /// Mark the running stage as done
    pub fn complete(&mut self) -> Result<()> {
        let stage = self.current().ok_or_else(|| {
            LiquidityError::DataError(format!("no stage running in state {:?}", self.state))
        })?;
        self.completed.push(stage);
        self.state = if stage == Stage::Commit {
            CycleState::Committed
        } else {
            CycleState::Idle
        };
        Ok(())
    }

    /// Mark the running stage as failed and return it
    pub fn fail(&mut self) -> Option<Stage> {
        let stage = self.current()?;
        self.state = CycleState::Failed(stage);
        Some(stage)
    }
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}
