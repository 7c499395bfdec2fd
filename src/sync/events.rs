//! Progress events
//!
//! The orchestrator is the only producer of sync progress. Consumers (CLI,
//! HTTP stream, tests) subscribe to a broadcast channel and drain it at
//! their own pace.

use super::report::{RunOutcome, RunTotals};
use crate::model::{RunId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle point of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Started,
    Progress,
    Completed,
    Failed,
}

/// What a step works on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Project,
    Task,
    Validation,
}

/// One step event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step_id: StepId,
    pub kind: StepKind,
    pub item_type: ItemType,

    /// Share of the run's steps finished, 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<u8>,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StepEvent {
    pub fn new(step_id: StepId, kind: StepKind, item_type: ItemType) -> Self {
        Self {
            step_id,
            kind,
            item_type,
            progress_pct: None,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn with_progress(mut self, pct: u8) -> Self {
        self.progress_pct = Some(pct.min(100));
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Final event of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub totals: RunTotals,
    pub elapsed_ms: u64,
    pub outcome: RunOutcome,
}

/// Event on the progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Step(StepEvent),
    RunCompleted(RunSummary),
}

impl SyncEvent {
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            SyncEvent::Step(step) => Some(&step.step_id),
            SyncEvent::RunCompleted(_) => None,
        }
    }

    pub fn is_run_completed(&self) -> bool {
        matches!(self, SyncEvent::RunCompleted(_))
    }
}

/// Broadcast sender with capacity monitoring
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SyncEvent>,
    capacity: usize,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Send an event, logging if it was dropped or the channel is filling up
    pub fn emit(&self, event: SyncEvent) {
        match self.tx.send(event) {
            Ok(receivers) => {
                let len = self.tx.len();
                if len > self.capacity * 80 / 100 {
                    tracing::warn!(
                        current = len,
                        capacity = self.capacity,
                        threshold_pct = 80,
                        "Event channel nearing capacity"
                    );
                }
                if receivers == 0 {
                    tracing::trace!("Event sent but no receivers subscribed");
                }
            }
            Err(_) => {
                // only fails when nobody is listening
                tracing::trace!("Event dropped, no receivers");
            }
        }
    }

    pub fn step(&self, event: StepEvent) {
        self.emit(SyncEvent::Step(event));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1000)
    }
}
