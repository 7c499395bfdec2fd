//! Orphan task cleanup
//!
//! Orphans are list service tasks without a project. They never reach a
//! project-scoped view in the doc store, so users periodically sweep them
//! into a triage project.

use crate::integrations::{with_retry, Connector, RetryConfig, TaskFilter};
use crate::model::{NativeId, RunId, StepId, Task, TaskPatch};
use crate::sync::{
    EventSink, ItemType, RunOutcome, RunSummary, RunTotals, StepEvent, StepKind, SyncEvent,
};
use crate::{Result, TaskSyncError};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

/// A task that could not be moved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanFailure {
    pub native_id: NativeId,
    pub title: String,
    pub error: String,
}

/// Outcome of an orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub inbox_project: String,
    pub moved: Vec<NativeId>,
    pub failed: Vec<OrphanFailure>,
}

impl OrphanReport {
    pub fn moved_count(&self) -> usize {
        self.moved.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// Open tasks without a project
pub async fn find_orphans(connector: &dyn Connector, filter: &TaskFilter) -> Result<Vec<Task>> {
    let tasks = connector.fetch_all(filter).await?;
    let orphans: Vec<Task> = tasks
        .into_iter()
        .filter(|t| t.is_orphan() && !t.completed)
        .collect();
    info!(system = %connector.system(), count = orphans.len(), "Found orphan tasks");
    Ok(orphans)
}

/// Move each orphan into `inbox_project`, one step per task
///
/// A failed move is recorded and the sweep continues.
pub async fn move_orphans_to_inbox(
    connector: &dyn Connector,
    inbox_project: &str,
    orphans: &[Task],
    events: &EventSink,
    retry: &RetryConfig,
) -> Result<OrphanReport> {
    let inbox = inbox_project.trim();
    if inbox.is_empty() {
        return Err(TaskSyncError::Validation(
            "inbox project name is empty".to_string(),
        ));
    }

    let clock = Instant::now();
    let total = orphans.len();
    let mut report = OrphanReport {
        inbox_project: inbox.to_string(),
        ..Default::default()
    };

    for (i, task) in orphans.iter().enumerate() {
        let step_id = StepId::new(format!("orphan:{}", task.id));
        events.step(StepEvent::new(
            step_id.clone(),
            StepKind::Started,
            ItemType::Task,
        ));

        let patch = TaskPatch {
            project_ref: Some(Some(inbox.to_string())),
            ..Default::default()
        }
        .with_expected_revision(task.revision.marker.clone());
        let patch = &patch;
        let result =
            with_retry(retry, "move_orphan", move || connector.update(&task.id, patch)).await;

        let pct = (((i + 1) * 100) / total) as u8;
        match result {
            Ok(_) => {
                events.step(
                    StepEvent::new(step_id, StepKind::Completed, ItemType::Task)
                        .with_progress(pct)
                        .with_detail(task.title.clone()),
                );
                report.moved.push(task.id.clone());
            }
            Err(e) => {
                warn!(native_id = %task.id, error = %e, "Failed to move orphan");
                events.step(
                    StepEvent::new(step_id, StepKind::Failed, ItemType::Task)
                        .with_progress(pct)
                        .with_detail(e.to_string()),
                );
                report.failed.push(OrphanFailure {
                    native_id: task.id.clone(),
                    title: task.title.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    let totals = RunTotals {
        total_applied: report.moved_count(),
        total_failed: report.failed_count(),
        ..Default::default()
    };
    events.emit(SyncEvent::RunCompleted(RunSummary {
        run_id: RunId::generate(),
        totals,
        elapsed_ms: clock.elapsed().as_millis() as u64,
        outcome: RunOutcome::Completed,
    }));

    info!(
        inbox = %report.inbox_project,
        moved = report.moved_count(),
        failed = report.failed_count(),
        "Orphan sweep finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{FaultKind, FaultOp, MemoryConnector};
    use crate::model::{SourceSystem, TaskFields};

    fn seeded() -> MemoryConnector {
        let list = MemoryConnector::new(SourceSystem::ListService);
        list.add_task("1", TaskFields::new("Call the bank")).unwrap();
        list.add_task("2", TaskFields::new("Plan sprint").with_project("Work"))
            .unwrap();
        list.add_task("3", TaskFields::new("Buy stamps")).unwrap();
        list.add_task("4", TaskFields::new("Old chore").with_completed(true))
            .unwrap();
        list
    }

    #[tokio::test]
    async fn test_find_orphans_skips_projects_and_completed() {
        let list = seeded();
        let orphans = find_orphans(&list, &TaskFilter::all()).await.unwrap();
        let ids: Vec<&str> = orphans.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_move_orphans_reports_progress_and_failures() {
        let list = seeded();
        list.inject_fault(FaultOp::Update, "3", FaultKind::Validation, None);
        let orphans = find_orphans(&list, &TaskFilter::all()).await.unwrap();

        let events = EventSink::new(64);
        let mut rx = events.subscribe();
        let report = move_orphans_to_inbox(
            &list,
            "Triage",
            &orphans,
            &events,
            &RetryConfig::immediate(0),
        )
        .await
        .unwrap();

        assert_eq!(report.moved, vec![NativeId::new("1")]);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(list.get("1").unwrap().project_ref.as_deref(), Some("Triage"));

        let mut pcts = Vec::new();
        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                SyncEvent::Step(step) if step.kind != StepKind::Started => {
                    pcts.push(step.progress_pct)
                }
                SyncEvent::RunCompleted(summary) => completed = Some(summary),
                _ => {}
            }
        }
        assert_eq!(pcts, vec![Some(50), Some(100)]);
        let summary = completed.unwrap();
        assert_eq!(summary.totals.total_applied, 1);
        assert_eq!(summary.totals.total_failed, 1);
    }

    #[tokio::test]
    async fn test_empty_inbox_rejected() {
        let list = seeded();
        let err = move_orphans_to_inbox(
            &list,
            "  ",
            &[],
            &EventSink::default(),
            &RetryConfig::immediate(0),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskSyncError::Validation(_)));
    }
}
