//! Integration tests for TaskSync
//!
//! These tests drive full preview/apply runs through the public API, with
//! in-memory backends standing in for the real services.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tasksync::integrations::{Connector, FaultKind, FaultOp, MemoryConnector, RetryConfig, TaskFilter};
use tasksync::ledger::{LedgerConfig, LedgerStore, MemoryLedger, SqliteLedger};
use tasksync::model::{ConflictReason, NativeId, SourceSystem, Task, TaskFields, TaskPatch};
use tasksync::sync::{
    CancelToken, ItemOutcome, ItemType, OrchestratorSettings, RunOutcome, Selections, StepKind,
    SyncEvent, SyncOrchestrator,
};
use tasksync::TaskSyncError;
use tempfile::TempDir;

/// Backends plus an orchestrator over them
struct Harness {
    list: Arc<MemoryConnector>,
    doc: Arc<MemoryConnector>,
    ledger: Arc<dyn LedgerStore>,
    orchestrator: Arc<SyncOrchestrator>,
}

fn settings(workers: usize) -> OrchestratorSettings {
    OrchestratorSettings::default()
        .with_max_workers(workers)
        .with_retry(RetryConfig::immediate(2))
}

fn harness_with(
    list: Arc<MemoryConnector>,
    doc: Arc<dyn Connector>,
    doc_store: Arc<MemoryConnector>,
    ledger: Arc<dyn LedgerStore>,
    workers: usize,
) -> Harness {
    let orchestrator =
        SyncOrchestrator::new(list.clone(), doc, ledger.clone()).with_settings(settings(workers));
    Harness {
        list,
        doc: doc_store,
        ledger,
        orchestrator: Arc::new(orchestrator),
    }
}

fn harness() -> Harness {
    let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
    harness_with(
        Arc::new(MemoryConnector::new(SourceSystem::ListService)),
        doc.clone(),
        doc,
        Arc::new(MemoryLedger::new()),
        4,
    )
}

impl Harness {
    /// Preview and apply everything that is not deferred
    async fn sync_all(&self) -> tasksync::sync::SyncReport {
        let change_set = self.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        self.orchestrator
            .apply(&change_set, &Selections::All, &CancelToken::new())
            .await
            .unwrap()
    }

    fn doc_id_for(&self, list_id: &str) -> NativeId {
        self.ledger
            .find_by_native_ref(SourceSystem::ListService, &NativeId::new(list_id))
            .unwrap()
            .expect("linked")
            .doc_store_ref
    }
}

/// Doc store wrapper that cancels the run after a number of creates
struct CancelAfterCreates {
    inner: Arc<MemoryConnector>,
    token: CancelToken,
    after: usize,
    creates: AtomicUsize,
}

#[async_trait]
impl Connector for CancelAfterCreates {
    fn system(&self) -> SourceSystem {
        self.inner.system()
    }

    async fn fetch_all(&self, filter: &TaskFilter) -> tasksync::Result<Vec<Task>> {
        self.inner.fetch_all(filter).await
    }

    async fn fetch_one(&self, id: &NativeId) -> tasksync::Result<Option<Task>> {
        self.inner.fetch_one(id).await
    }

    async fn create(&self, fields: &TaskFields) -> tasksync::Result<Task> {
        let task = self.inner.create(fields).await?;
        if self.creates.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        Ok(task)
    }

    async fn update(&self, id: &NativeId, patch: &TaskPatch) -> tasksync::Result<Task> {
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &NativeId) -> tasksync::Result<()> {
        self.inner.delete(id).await
    }
}

/// Doc store wrapper whose creates block until released
struct GatedCreates {
    inner: Arc<MemoryConnector>,
    entered: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

#[async_trait]
impl Connector for GatedCreates {
    fn system(&self) -> SourceSystem {
        self.inner.system()
    }

    async fn fetch_all(&self, filter: &TaskFilter) -> tasksync::Result<Vec<Task>> {
        self.inner.fetch_all(filter).await
    }

    async fn fetch_one(&self, id: &NativeId) -> tasksync::Result<Option<Task>> {
        self.inner.fetch_one(id).await
    }

    async fn create(&self, fields: &TaskFields) -> tasksync::Result<Task> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.create(fields).await
    }

    async fn update(&self, id: &NativeId, patch: &TaskPatch) -> tasksync::Result<Task> {
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &NativeId) -> tasksync::Result<()> {
        self.inner.delete(id).await
    }
}

mod apply_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_sync_links_both_directions() {
        let h = harness();
        h.list
            .add_task("l1", TaskFields::new("Pay rent").with_project("Home"))
            .unwrap();
        h.doc
            .add_task("p1", TaskFields::new("Draft Q3 deck").with_project("Work"))
            .unwrap();

        let report = h.sync_all().await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.totals.total_applied, 2);
        assert_eq!(h.ledger.all_links().unwrap().len(), 2);

        let titles: Vec<String> = h.list.tasks().into_iter().map(|t| t.title).collect();
        assert!(titles.contains(&"Draft Q3 deck".to_string()));
        let titles: Vec<String> = h.doc.tasks().into_iter().map(|t| t.title).collect();
        assert!(titles.contains(&"Pay rent".to_string()));
    }

    #[tokio::test]
    async fn test_rediff_after_apply_is_empty() {
        let h = harness();
        for i in 0..3 {
            h.list
                .add_task(format!("l{}", i), TaskFields::new(format!("Task {}", i)))
                .unwrap();
        }
        h.sync_all().await;

        h.list.touch("l1", |f| f.completed = true).unwrap();
        h.sync_all().await;

        let again = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert!(again.is_empty(), "unexpected changes: {:?}", again.summary());
        assert!(h.doc.get(h.doc_id_for("l1").as_str()).unwrap().completed);
    }

    #[tokio::test]
    async fn test_reapplying_change_set_is_a_no_op() {
        let h = harness();
        h.list.add_task("l1", TaskFields::new("Renew passport")).unwrap();
        let creates = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        h.orchestrator
            .apply(&creates, &Selections::All, &CancelToken::new())
            .await
            .unwrap();

        let report = h
            .orchestrator
            .apply(&creates, &Selections::All, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.totals.total_applied, 0);
        assert_eq!(report.totals.total_skipped, 1);
        assert_eq!(h.doc.tasks().len(), 1);

        h.list
            .touch("l1", |f| f.title = "Renew passport before June".into())
            .unwrap();
        let updates = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert_eq!(updates.updates.len(), 1);
        h.orchestrator
            .apply(&updates, &Selections::All, &CancelToken::new())
            .await
            .unwrap();
        let doc_id = h.doc_id_for("l1");
        let written = h.doc.get(doc_id.as_str()).unwrap();

        let report = h
            .orchestrator
            .apply(&updates, &Selections::All, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.totals.total_applied, 0);
        assert_eq!(
            report.items[0].outcome,
            ItemOutcome::skipped("already in sync")
        );
        // the stale write was refused, nothing changed on the doc side
        assert_eq!(h.doc.get(doc_id.as_str()).unwrap().revision, written.revision);

        let again = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_updates_ledger_for_successes_only() {
        let h = harness();
        for i in 1..=5 {
            h.list
                .add_task(format!("l{}", i), TaskFields::new(format!("Task {}", i)))
                .unwrap();
        }
        h.sync_all().await;

        for i in 1..=5 {
            h.list
                .touch(&format!("l{}", i), |f| f.title = format!("Task {} (edited)", i))
                .unwrap();
        }
        let failing = h.doc_id_for("l3");
        h.doc
            .inject_fault(FaultOp::Update, failing.as_str(), FaultKind::Transient, None);

        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert_eq!(change_set.updates.len(), 5);
        let report = h
            .orchestrator
            .apply(&change_set, &Selections::All, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.totals.total_applied, 4);
        assert_eq!(report.totals.total_failed, 1);
        let failed = report
            .items
            .iter()
            .find(|i| matches!(i.outcome, ItemOutcome::Failed { .. }))
            .unwrap();
        assert_eq!(failed.title, "Task 3 (edited)");

        for i in 1..=5 {
            let id = format!("l{}", i);
            let link = h
                .ledger
                .find_by_native_ref(SourceSystem::ListService, &NativeId::new(id.as_str()))
                .unwrap()
                .unwrap();
            let current = h.list.get(&id).unwrap().revision.marker;
            assert_eq!(link.last_synced_revision_list == current, i != 3, "link of {}", id);
        }

        h.doc.clear_faults();
        let retry = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert_eq!(retry.updates.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_skips_remaining_items() {
        let token = CancelToken::new();
        let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
        let gate = Arc::new(CancelAfterCreates {
            inner: doc.clone(),
            token: token.clone(),
            after: 2,
            creates: AtomicUsize::new(0),
        });
        let h = harness_with(
            Arc::new(MemoryConnector::new(SourceSystem::ListService)),
            gate,
            doc,
            Arc::new(MemoryLedger::new()),
            1,
        );
        for i in 1..=7 {
            h.list
                .add_task(format!("l{}", i), TaskFields::new(format!("Task {}", i)))
                .unwrap();
        }

        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        let report = h
            .orchestrator
            .apply(&change_set, &Selections::All, &token)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.items.len(), 7);
        assert_eq!(report.totals.total_applied, 2);
        assert_eq!(report.totals.total_skipped, 5);
        assert_eq!(h.doc.tasks().len(), 2);
        assert_eq!(h.ledger.all_links().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_with_parallel_workers_lets_in_flight_items_finish() {
        let token = CancelToken::new();
        let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
        let gate = Arc::new(CancelAfterCreates {
            inner: doc.clone(),
            token: token.clone(),
            after: 2,
            creates: AtomicUsize::new(0),
        });
        let workers = OrchestratorSettings::default().max_workers;
        let h = harness_with(
            Arc::new(MemoryConnector::new(SourceSystem::ListService)),
            gate,
            doc,
            Arc::new(MemoryLedger::new()),
            workers,
        );
        for i in 1..=7 {
            h.list
                .add_task(format!("l{}", i), TaskFields::new(format!("Task {}", i)))
                .unwrap();
        }

        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        let report = h
            .orchestrator
            .apply(&change_set, &Selections::All, &token)
            .await
            .unwrap();

        // items started before the cancel complete; the 6th and 7th can only
        // start once the 2nd has finished, so they are always skipped
        let applied = report.totals.total_applied;
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!((2..=5).contains(&applied), "applied {}", applied);
        assert_eq!(report.totals.total_skipped, 7 - applied);
        assert_eq!(h.doc.tasks().len(), applied);
        assert_eq!(h.ledger.all_links().unwrap().len(), applied);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_run() {
        let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
        let h = harness_with(
            Arc::new(MemoryConnector::new(SourceSystem::ListService)),
            doc.clone(),
            doc,
            Arc::new(MemoryLedger::new()),
            1,
        );
        for i in 1..=3 {
            h.list
                .add_task(format!("l{}", i), TaskFields::new(format!("Task {}", i)))
                .unwrap();
        }
        h.doc
            .inject_fault(FaultOp::Create, "*", FaultKind::Auth, None);

        let report = h.sync_all().await;
        match report.outcome {
            RunOutcome::Aborted { ref reason } => assert!(reason.contains("Authentication")),
            ref other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(report.totals.total_failed, 1);
        assert_eq!(report.totals.total_skipped, 2);
        // auth errors are never retried
        assert_eq!(h.doc.call_count(FaultOp::Create), 1);

        let history = h.orchestrator.history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, report.run_id);
    }

    #[tokio::test]
    async fn test_unselected_items_are_skipped() {
        let h = harness();
        h.list.add_task("l1", TaskFields::new("Keep")).unwrap();
        h.list.add_task("l2", TaskFields::new("Hold back")).unwrap();

        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        let chosen = change_set.creates[0].step_id.clone();
        let report = h
            .orchestrator
            .apply(
                &change_set,
                &Selections::only([chosen.clone()]),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.totals.total_applied, 1);
        assert_eq!(report.totals.total_skipped, 1);
        assert_eq!(report.item(chosen.as_str()).unwrap().outcome, ItemOutcome::Applied);
        assert_eq!(h.doc.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_task_is_reported_not_synced() {
        let h = harness();
        h.list.add_task("l1", TaskFields::new("   ")).unwrap();
        h.list.add_task("l2", TaskFields::new("Real task")).unwrap();

        let report = h.sync_all().await;
        assert_eq!(report.totals.total_applied, 1);
        let invalid = report
            .items
            .iter()
            .find(|i| i.step_id.as_str().starts_with("invalid:"))
            .unwrap();
        assert!(matches!(invalid.outcome, ItemOutcome::Skipped { .. }));
        assert_eq!(h.doc.tasks().len(), 1);
    }
}

mod conflict_tests {
    use super::*;

    #[tokio::test]
    async fn test_probable_duplicate_is_deferred() {
        let h = harness();
        let due = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        h.list
            .add_task(
                "l1",
                TaskFields::new("Revisar propuesta de cliente ABC").with_due_date(due),
            )
            .unwrap();
        h.doc
            .add_task(
                "p1",
                TaskFields::new("  revisar propuesta de cliente abc ").with_due_date(due),
            )
            .unwrap();

        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert!(change_set.creates.is_empty());
        assert_eq!(change_set.conflicts.len(), 1);
        assert_eq!(
            change_set.conflicts[0].reason,
            ConflictReason::PotentialDuplicate
        );

        let report = h
            .orchestrator
            .apply(&change_set, &Selections::All, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.totals.total_deferred, 1);
        assert_eq!(h.list.tasks().len(), 1);
        assert_eq!(h.doc.tasks().len(), 1);
        assert!(h.ledger.all_links().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_both_sides_edited_merge_by_field() {
        let h = harness();
        h.list.add_task("l1", TaskFields::new("Call ABC")).unwrap();
        h.sync_all().await;
        let doc_id = h.doc_id_for("l1");

        let due = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        h.list
            .touch("l1", |f| f.title = "Call ABC about renewal".into())
            .unwrap();
        h.doc
            .touch(doc_id.as_str(), |f| f.due_date = Some(due))
            .unwrap();

        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert_eq!(change_set.conflicts.len(), 1);
        assert!(change_set.conflicts[0].proposed.is_some());

        let report = h
            .orchestrator
            .apply(&change_set, &Selections::All, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.totals.total_applied, 1);

        let list_task = h.list.get("l1").unwrap();
        let doc_task = h.doc.get(doc_id.as_str()).unwrap();
        assert_eq!(list_task.title, "Call ABC about renewal");
        assert_eq!(list_task.due_date, Some(due));
        assert_eq!(doc_task.title, "Call ABC about renewal");
        assert_eq!(doc_task.due_date, Some(due));

        let again = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert!(again.is_empty());
    }
}

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_apply_fails_fast_and_preview_still_works() {
        let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
        let gated = Arc::new(GatedCreates {
            inner: doc.clone(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let h = harness_with(
            Arc::new(MemoryConnector::new(SourceSystem::ListService)),
            gated.clone(),
            doc,
            Arc::new(MemoryLedger::new()),
            1,
        );
        h.list.add_task("l1", TaskFields::new("Slow create")).unwrap();

        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        let first = {
            let orchestrator = h.orchestrator.clone();
            let change_set = change_set.clone();
            tokio::spawn(async move {
                orchestrator
                    .apply(&change_set, &Selections::All, &CancelToken::new())
                    .await
            })
        };

        gated.entered.notified().await;
        assert!(h.orchestrator.is_applying());

        let err = h
            .orchestrator
            .apply(&change_set, &Selections::All, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskSyncError::RunInProgress));

        // previews never take the apply slot
        let concurrent = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert_eq!(concurrent.creates.len(), 1);

        gated.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.totals.total_applied, 1);
        assert!(!h.orchestrator.is_applying());
    }

    #[tokio::test]
    async fn test_apply_excludes_other_process_sharing_the_ledger() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.db");
        let list = Arc::new(MemoryConnector::new(SourceSystem::ListService));
        let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
        let gated = Arc::new(GatedCreates {
            inner: doc.clone(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        list.add_task("l1", TaskFields::new("Slow create")).unwrap();

        // one orchestrator per process, each with its own connection
        let cli = harness_with(
            list.clone(),
            gated.clone(),
            doc.clone(),
            Arc::new(SqliteLedger::open(LedgerConfig::new(&path)).unwrap()),
            1,
        );
        let server = harness_with(
            list,
            doc.clone(),
            doc.clone(),
            Arc::new(SqliteLedger::open(LedgerConfig::new(&path)).unwrap()),
            1,
        );

        let change_set = cli.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        let first = {
            let orchestrator = cli.orchestrator.clone();
            let change_set = change_set.clone();
            tokio::spawn(async move {
                orchestrator
                    .apply(&change_set, &Selections::All, &CancelToken::new())
                    .await
            })
        };
        gated.entered.notified().await;

        let other = server.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        let err = server
            .orchestrator
            .apply(&other, &Selections::All, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskSyncError::RunInProgress));
        assert!(!server.orchestrator.is_applying());

        gated.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.totals.total_applied, 1);
        assert_eq!(doc.tasks().len(), 1);

        // the slot is free again once the first run is done
        let report = server
            .orchestrator
            .apply(&other, &Selections::All, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.totals.total_applied, 0);
        assert_eq!(doc.tasks().len(), 1);
        assert_eq!(server.ledger.all_links().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_event_stream_order() {
        let h = harness();
        for i in 1..=3 {
            h.list
                .add_task(format!("l{}", i), TaskFields::new(format!("Task {}", i)))
                .unwrap();
        }
        let mut rx = h.orchestrator.subscribe();
        h.sync_all().await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        match events.first() {
            Some(SyncEvent::Step(step)) => {
                assert_eq!(step.item_type, ItemType::Validation);
                assert_eq!(step.kind, StepKind::Started);
            }
            other => panic!("expected validation step first, got {:?}", other),
        }
        assert!(events.last().unwrap().is_run_completed());

        for event in &events {
            if let SyncEvent::Step(step) = event {
                if step.item_type != ItemType::Task || step.kind != StepKind::Completed {
                    continue;
                }
                let started = events.iter().position(|e| match e {
                    SyncEvent::Step(s) => s.step_id == step.step_id && s.kind == StepKind::Started,
                    _ => false,
                });
                let completed = events.iter().position(|e| std::ptr::eq(e, event));
                assert!(started < completed);
            }
        }

        let last_pct = events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::Step(s) if s.item_type == ItemType::Task => s.progress_pct,
                _ => None,
            })
            .max();
        assert_eq!(last_pct, Some(100));
    }
}

mod ledger_tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_ledger_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.db");
        let list = Arc::new(MemoryConnector::new(SourceSystem::ListService));
        let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
        list.add_task("l1", TaskFields::new("Pay rent")).unwrap();
        doc.add_task("p1", TaskFields::new("Book dentist")).unwrap();

        {
            let ledger = Arc::new(SqliteLedger::open(LedgerConfig::new(&path)).unwrap());
            let h = harness_with(list.clone(), doc.clone(), doc.clone(), ledger, 2);
            let report = h.sync_all().await;
            assert_eq!(report.totals.total_applied, 2);
        }

        let ledger = Arc::new(SqliteLedger::open(LedgerConfig::new(&path)).unwrap());
        let h = harness_with(list, doc.clone(), doc, ledger, 2);
        assert_eq!(h.ledger.all_links().unwrap().len(), 2);

        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert!(change_set.is_empty());
        assert_eq!(h.orchestrator.history(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_task_completes_counterpart() {
        let h = harness();
        h.list.add_task("l1", TaskFields::new("Water plants")).unwrap();
        h.sync_all().await;
        let doc_id = h.doc_id_for("l1");

        h.list.remove_task("l1").unwrap();
        let change_set = h.orchestrator.preview(&TaskFilter::all()).await.unwrap();
        assert_eq!(change_set.deletes.len(), 1);

        // deletes are not pre-selected
        let report = h
            .orchestrator
            .apply(
                &change_set,
                &Selections::defaults_for(&change_set),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.totals.total_skipped, 1);
        assert!(!h.doc.get(doc_id.as_str()).unwrap().completed);

        let report = h
            .orchestrator
            .apply(&change_set, &Selections::All, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.totals.total_applied, 1);
        assert!(h.doc.get(doc_id.as_str()).unwrap().completed);
        assert!(h.ledger.all_links().unwrap().is_empty());
    }
}
