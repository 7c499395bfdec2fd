//! Run state machine
//!
//! `Idle -> Fetching -> Diffing -> (PreviewReady | Applying) -> Finalizing -> Idle`,
//! with `Aborted` reachable from any non-idle state. An apply of an already
//! previewed change set enters `Applying` straight from `Idle` or
//! `PreviewReady`.

use crate::{Result, TaskSyncError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Diffing,
    PreviewReady,
    Applying,
    Finalizing,
    Aborted,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Aborted) => false,
            (_, Aborted) => true,
            (Idle, Fetching) | (Idle, Applying) => true,
            (Fetching, Diffing) => true,
            (Diffing, PreviewReady) | (Diffing, Applying) => true,
            (PreviewReady, Applying) | (PreviewReady, Idle) => true,
            (Applying, Finalizing) => true,
            (Finalizing, Idle) | (Aborted, Idle) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Idle | RunState::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Diffing => "diffing",
            RunState::PreviewReady => "preview_ready",
            RunState::Applying => "applying",
            RunState::Finalizing => "finalizing",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Tracks one run's state and rejects illegal transitions
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    history: Vec<RunState>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            history: vec![RunState::Idle],
        }
    }

    pub fn current(&self) -> RunState {
        self.state
    }

    /// States visited so far, starting with `Idle`
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TaskSyncError::Other(format!(
                "invalid run state transition {} -> {}",
                self.state, next
            )));
        }
        tracing::trace!(from = %self.state, to = %next, "Run state transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Aborted` unless already idle
    pub fn abort(&mut self) {
        if self.state != RunState::Idle && self.state != RunState::Aborted {
            self.state = RunState::Aborted;
            self.history.push(RunState::Aborted);
        }
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
