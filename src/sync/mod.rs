//! Sync runs
//!
//! Preview computes a change set; apply executes the confirmed part of it
//! and produces a [`SyncReport`]. Progress is streamed as [`SyncEvent`]s.

mod cancel;
mod events;
mod orchestrator;
mod report;
mod state;

pub use cancel::CancelToken;
pub use events::{EventSink, ItemType, RunSummary, StepEvent, StepKind, SyncEvent};
pub use orchestrator::{OrchestratorSettings, Selections, SyncOrchestrator};
pub use report::{ItemAction, ItemOutcome, ItemReport, RunOutcome, RunTotals, SyncReport};
pub use state::{RunState, RunStateMachine};
