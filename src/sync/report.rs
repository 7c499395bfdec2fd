//! Run reports
//!
//! A report enumerates every item of the applied change set with its
//! outcome. No item is ever left out.

use crate::model::{ChangeSetId, RunId, SourceSystem, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an item does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Create,
    Update,
    ResolveConflict,
    Delete,
    Validate,
}

/// Result of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Applied,
    Failed { error: String, kind: String },
    Skipped { reason: String },
    Deferred { reason: String },
}

impl ItemOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        ItemOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(err: &crate::TaskSyncError) -> Self {
        ItemOutcome::Failed {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }
    }

    /// Label used for metrics and summaries
    pub fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Applied => "applied",
            ItemOutcome::Failed { .. } => "failed",
            ItemOutcome::Skipped { .. } => "skipped",
            ItemOutcome::Deferred { .. } => "deferred",
        }
    }
}

/// Report line for one change set item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub step_id: StepId,
    pub action: ItemAction,
    pub title: String,

    /// Backend written by this item, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<SourceSystem>,

    pub outcome: ItemOutcome,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Aborted { reason: String },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Item counts by outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub total_applied: usize,
    pub total_failed: usize,
    pub total_skipped: usize,
    pub total_deferred: usize,
}

impl RunTotals {
    pub fn from_items(items: &[ItemReport]) -> Self {
        let mut totals = Self::default();
        for item in items {
            match item.outcome {
                ItemOutcome::Applied => totals.total_applied += 1,
                ItemOutcome::Failed { .. } => totals.total_failed += 1,
                ItemOutcome::Skipped { .. } => totals.total_skipped += 1,
                ItemOutcome::Deferred { .. } => totals.total_deferred += 1,
            }
        }
        totals
    }
}

/// Final result of an apply run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: RunId,
    pub change_set_id: ChangeSetId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: RunOutcome,
    pub items: Vec<ItemReport>,
    pub totals: RunTotals,
}

impl SyncReport {
    /// Report for a run with no items
    pub fn empty(outcome: RunOutcome) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::generate(),
            change_set_id: ChangeSetId::pending(),
            started_at: now,
            finished_at: now,
            elapsed_ms: 0,
            outcome,
            items: Vec::new(),
            totals: RunTotals::default(),
        }
    }

    pub fn item(&self, step_id: &str) -> Option<&ItemReport> {
        self.items.iter().find(|i| i.step_id.as_str() == step_id)
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(step: &str, outcome: ItemOutcome) -> ItemReport {
        ItemReport {
            step_id: StepId::new(step),
            action: ItemAction::Update,
            title: "Pay rent".to_string(),
            target: Some(SourceSystem::DocStore),
            outcome,
        }
    }

    #[test]
    fn test_totals() {
        let items = vec![
            item("a", ItemOutcome::Applied),
            item("b", ItemOutcome::Applied),
            item("c", ItemOutcome::skipped("not selected")),
            item(
                "d",
                ItemOutcome::Failed {
                    error: "boom".to_string(),
                    kind: "transient".to_string(),
                },
            ),
            item(
                "e",
                ItemOutcome::Deferred {
                    reason: "manual".to_string(),
                },
            ),
        ];
        let totals = RunTotals::from_items(&items);
        assert_eq!(totals.total_applied, 2);
        assert_eq!(totals.total_failed, 1);
        assert_eq!(totals.total_skipped, 1);
        assert_eq!(totals.total_deferred, 1);
    }

    #[test]
    fn test_report_json_round_trip() {
        let mut report = SyncReport::empty(RunOutcome::Aborted {
            reason: "token rejected".to_string(),
        });
        report.items.push(item("a", ItemOutcome::skipped("run aborted")));
        report.totals = RunTotals::from_items(&report.items);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"aborted\""));
        let back: SyncReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert!(back.item("a").is_some());
        assert!(!back.is_completed());
    }
}
