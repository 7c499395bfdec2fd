//! Sync orchestrator
//!
//! Sequences a run: fetch both backends concurrently, diff against the
//! ledger, propose conflict resolutions, then apply the confirmed items
//! through the adapters while updating the ledger and streaming progress.
//!
//! Only one apply may run at a time; a second caller gets `RunInProgress`
//! immediately. The slot is claimed both in this process and in the ledger,
//! so a CLI run and a server sharing one ledger exclude each other too.
//! Previews never touch the ledger and may run alongside an apply.

use super::cancel::CancelToken;
use super::events::{EventSink, ItemType, RunSummary, StepEvent, StepKind, SyncEvent};
use super::report::{ItemAction, ItemOutcome, ItemReport, RunOutcome, RunTotals, SyncReport};
use super::state::{RunState, RunStateMachine};
use crate::config::{DeleteMode, SyncSettings, TaskSyncConfig};
use crate::diff::{compute_change_set_with, diff_pair, DiffOptions, PairDiff};
use crate::integrations::{
    with_retry, Connector, DocStoreAdapter, ListServiceAdapter, RetryConfig, TaskFilter, Throttled,
};
use crate::ledger::{LedgerConfig, LedgerStore, SqliteLedger};
use crate::metrics;
use crate::model::{
    ChangeSet, ChangeSetId, ConflictItem, CreateItem, DeleteItem, Field, InvalidItem, NativeId,
    RunId, SourceSystem, StepId, SyncLink, Task, TaskFields, TaskPatch, UpdateItem,
};
use crate::resolver::{ConflictResolver, DefaultResolver, Resolution};
use crate::{Result, TaskSyncError};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Previews kept for `apply_by_id`
const PREVIEW_CACHE_SIZE: usize = 16;

/// Step id of the validation step that opens every apply
const VALIDATION_STEP: &str = "validation";

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub delete_mode: DeleteMode,
    /// Items processed concurrently during apply
    ///
    /// Cancellation is checked when an item starts, so up to this many items
    /// already in flight still finish after a cancel. Use 1 to stop right
    /// after the current item.
    pub max_workers: usize,
    pub retry: RetryConfig,
    pub history_limit: usize,
    pub event_channel_capacity: usize,
    /// Age after which another process's apply claim counts as abandoned
    pub run_lock_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl OrchestratorSettings {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            delete_mode: settings.delete_mode,
            max_workers: settings.max_workers.max(1),
            retry: RetryConfig::from_settings(&settings.retry),
            history_limit: settings.history_limit,
            event_channel_capacity: settings.event_channel_capacity,
            run_lock_timeout: Duration::from_secs(settings.run_lock_timeout_secs),
        }
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_delete_mode(mut self, mode: DeleteMode) -> Self {
        self.delete_mode = mode;
        self
    }
}

/// Items the caller confirmed for an apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "steps", rename_all = "snake_case")]
pub enum Selections {
    /// Every item whose resolution is not deferred
    All,
    /// Only the listed steps
    Only(BTreeSet<StepId>),
}

impl Selections {
    /// Pre-checked items of the preview screen: creates and updates
    pub fn defaults_for(change_set: &ChangeSet) -> Self {
        Selections::Only(change_set.default_selection())
    }

    pub fn only<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        Selections::Only(steps.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, step_id: &StepId) -> bool {
        match self {
            Selections::All => true,
            Selections::Only(steps) => steps.contains(step_id),
        }
    }
}

/// One change set entry in apply order
#[derive(Clone, Copy)]
enum Planned<'a> {
    Create(&'a CreateItem),
    Update(&'a UpdateItem),
    Conflict(&'a ConflictItem),
    Delete(&'a DeleteItem),
    Invalid(&'a InvalidItem),
}

impl Planned<'_> {
    fn step_id(&self) -> &StepId {
        match self {
            Planned::Create(c) => &c.step_id,
            Planned::Update(u) => &u.step_id,
            Planned::Conflict(c) => &c.step_id,
            Planned::Delete(d) => &d.step_id,
            Planned::Invalid(i) => &i.step_id,
        }
    }

    fn action(&self) -> ItemAction {
        match self {
            Planned::Create(_) => ItemAction::Create,
            Planned::Update(_) => ItemAction::Update,
            Planned::Conflict(_) => ItemAction::ResolveConflict,
            Planned::Delete(_) => ItemAction::Delete,
            Planned::Invalid(_) => ItemAction::Validate,
        }
    }

    fn title(&self) -> String {
        match self {
            Planned::Create(c) => c.task.title.clone(),
            Planned::Update(u) => u.source.title.clone(),
            Planned::Conflict(c) => c.list_task.title.clone(),
            Planned::Delete(d) => d
                .counterpart
                .as_ref()
                .map(|t| t.title.clone())
                .or_else(|| d.link.snapshot.as_ref().map(|s| s.title.clone()))
                .unwrap_or_default(),
            Planned::Invalid(i) => i.title.clone(),
        }
    }

    fn target(&self) -> Option<SourceSystem> {
        match self {
            Planned::Create(c) => Some(c.target),
            Planned::Update(u) => Some(u.target),
            Planned::Conflict(_) => None,
            Planned::Delete(d) => d.target(),
            Planned::Invalid(_) => None,
        }
    }
}

fn plan(change_set: &ChangeSet) -> Vec<Planned<'_>> {
    let mut planned = Vec::with_capacity(change_set.item_count());
    planned.extend(change_set.creates.iter().map(Planned::Create));
    planned.extend(change_set.updates.iter().map(Planned::Update));
    planned.extend(change_set.conflicts.iter().map(Planned::Conflict));
    planned.extend(change_set.deletes.iter().map(Planned::Delete));
    planned.extend(change_set.invalid.iter().map(Planned::Invalid));
    planned
}

/// Per-run shared state
struct RunContext<'a> {
    run_id: RunId,
    cancel: &'a CancelToken,
    abort_reason: Mutex<Option<String>>,
    cancelled_items: AtomicBool,
    executable: usize,
    finished: AtomicUsize,
    seen_projects: Mutex<HashSet<String>>,
}

impl RunContext<'_> {
    fn aborted(&self) -> Option<String> {
        self.abort_reason.lock().ok().and_then(|r| r.clone())
    }

    fn abort(&self, reason: String) {
        if let Ok(mut slot) = self.abort_reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
    }

    /// Progress after one more executable item finished
    fn finish_one(&self) -> u8 {
        let done = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        percent(done, self.executable)
    }

    fn first_sighting(&self, project: &str) -> bool {
        self.seen_projects
            .lock()
            .map(|mut seen| seen.insert(project.to_string()))
            .unwrap_or(false)
    }
}

/// Exclusive right to run one apply
///
/// Claimed with [`SyncOrchestrator::try_begin_apply`]. Dropping it gives the
/// slot back, in this process and in the ledger.
pub struct ApplySlot {
    run_id: RunId,
    ledger: Arc<dyn LedgerStore>,
    state: Arc<Mutex<RunState>>,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for ApplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplySlot")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl ApplySlot {
    /// Id the run will report under
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for ApplySlot {
    fn drop(&mut self) {
        if let Err(e) = self.ledger.release_run(&self.run_id) {
            error!(run_id = %self.run_id, error = %e, "Failed to release apply lock");
        }
        if let Ok(mut state) = self.state.lock() {
            *state = RunState::Idle;
        }
        metrics::set_apply_in_progress(false);
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        ((done.min(total) * 100) / total) as u8
    }
}

/// Drives preview and apply runs
pub struct SyncOrchestrator {
    list: Arc<dyn Connector>,
    doc: Arc<dyn Connector>,
    ledger: Arc<dyn LedgerStore>,
    resolver: Arc<dyn ConflictResolver>,
    settings: OrchestratorSettings,
    apply_lock: Arc<tokio::sync::Mutex<()>>,
    apply_state: Arc<Mutex<RunState>>,
    previews: Mutex<VecDeque<ChangeSet>>,
    events: EventSink,
}

impl SyncOrchestrator {
    pub fn new(
        list: Arc<dyn Connector>,
        doc: Arc<dyn Connector>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        let settings = OrchestratorSettings::default();
        Self {
            list,
            doc,
            ledger,
            resolver: Arc::new(DefaultResolver::new()),
            events: EventSink::new(settings.event_channel_capacity),
            settings,
            apply_lock: Arc::new(tokio::sync::Mutex::new(())),
            apply_state: Arc::new(Mutex::new(RunState::Idle)),
            previews: Mutex::new(VecDeque::new()),
        }
    }

    /// Build the production stack from a config file: both HTTP adapters
    /// behind throttles, and the SQLite ledger
    pub fn from_config(config: &TaskSyncConfig) -> Result<Self> {
        let interval = Duration::from_millis(config.sync.min_request_interval_ms);
        let cap = config.sync.per_backend_concurrency;

        let list: Arc<dyn Connector> = Arc::new(Throttled::new(
            Arc::new(ListServiceAdapter::new(config.list_service.clone())?),
            cap,
            interval,
        ));
        let doc: Arc<dyn Connector> = Arc::new(Throttled::new(
            Arc::new(DocStoreAdapter::new(config.doc_store.clone())?),
            cap,
            interval,
        ));
        let ledger = Arc::new(SqliteLedger::open(LedgerConfig::new(
            config.storage.ledger_path.clone(),
        ))?);

        Ok(Self::new(list, doc, ledger)
            .with_settings(OrchestratorSettings::from_settings(&config.sync)))
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.events = EventSink::new(settings.event_channel_capacity);
        self.settings = settings;
        self
    }

    /// Subscribe to the progress stream
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn connector(&self, system: SourceSystem) -> &Arc<dyn Connector> {
        match system {
            SourceSystem::ListService => &self.list,
            SourceSystem::DocStore => &self.doc,
        }
    }

    /// Whether an apply of this orchestrator holds the run slot
    pub fn is_applying(&self) -> bool {
        self.state() == RunState::Applying
    }

    /// State of the apply slot
    pub fn state(&self) -> RunState {
        self.apply_state
            .lock()
            .map(|s| *s)
            .unwrap_or(RunState::Idle)
    }

    fn set_state(&self, state: RunState) {
        if let Ok(mut slot) = self.apply_state.lock() {
            *slot = state;
        }
    }

    /// Reports of past runs, most recent first
    pub fn history(&self, limit: usize) -> Result<Vec<SyncReport>> {
        self.ledger.history(limit)
    }

    /// A previously previewed change set
    pub fn cached_preview(&self, id: &ChangeSetId) -> Option<ChangeSet> {
        self.previews
            .lock()
            .ok()
            .and_then(|p| p.iter().find(|cs| &cs.id == id).cloned())
    }

    fn cache_preview(&self, change_set: &ChangeSet) {
        if let Ok(mut previews) = self.previews.lock() {
            previews.push_back(change_set.clone());
            while previews.len() > PREVIEW_CACHE_SIZE {
                previews.pop_front();
            }
        }
    }

    fn forget_preview(&self, id: &ChangeSetId) {
        if let Ok(mut previews) = self.previews.lock() {
            previews.retain(|cs| &cs.id != id);
        }
    }

    // Adapter calls: retried, and failures counted per backend

    fn note_error<T>(system: SourceSystem, result: &Result<T>) {
        if let Err(e) = result {
            metrics::record_adapter_error(system.as_str(), e.kind());
        }
    }

    async fn fetch_all(&self, system: SourceSystem, filter: &TaskFilter) -> Result<Vec<Task>> {
        let connector = self.connector(system);
        let result = with_retry(&self.settings.retry, "fetch_all", move || {
            connector.fetch_all(filter)
        })
        .await;
        Self::note_error(system, &result);
        result
    }

    async fn fetch_one(&self, system: SourceSystem, id: &NativeId) -> Result<Option<Task>> {
        let connector = self.connector(system);
        let result =
            with_retry(&self.settings.retry, "fetch_one", move || connector.fetch_one(id)).await;
        Self::note_error(system, &result);
        result
    }

    async fn create_on(&self, system: SourceSystem, fields: &TaskFields) -> Result<Task> {
        let connector = self.connector(system);
        let result =
            with_retry(&self.settings.retry, "create", move || connector.create(fields)).await;
        Self::note_error(system, &result);
        result
    }

    async fn update_on(
        &self,
        system: SourceSystem,
        id: &NativeId,
        patch: &TaskPatch,
    ) -> Result<Task> {
        let connector = self.connector(system);
        let result = with_retry(&self.settings.retry, "update", move || {
            connector.update(id, patch)
        })
        .await;
        Self::note_error(system, &result);
        result
    }

    async fn delete_on(&self, system: SourceSystem, id: &NativeId) -> Result<()> {
        let connector = self.connector(system);
        let result =
            with_retry(&self.settings.retry, "delete", move || connector.delete(id)).await;
        Self::note_error(system, &result);
        result
    }

    /// Fetch, diff and propose resolutions without applying anything
    pub async fn preview(&self, filter: &TaskFilter) -> Result<ChangeSet> {
        let mut machine = RunStateMachine::new();
        let result = self.preview_inner(filter, &mut machine).await;
        if result.is_err() {
            machine.abort();
        }
        result
    }

    async fn preview_inner(
        &self,
        filter: &TaskFilter,
        machine: &mut RunStateMachine,
    ) -> Result<ChangeSet> {
        machine.advance(RunState::Fetching)?;
        let (list_tasks, doc_tasks) = tokio::join!(
            self.fetch_all(SourceSystem::ListService, filter),
            self.fetch_all(SourceSystem::DocStore, filter)
        );
        let list_tasks = list_tasks?;
        let doc_tasks = doc_tasks?;

        machine.advance(RunState::Diffing)?;
        let links = self.ledger.all_links()?;
        let options = DiffOptions {
            detect_deletions: filter.is_unrestricted(),
        };
        let mut change_set = compute_change_set_with(&list_tasks, &doc_tasks, &links, options)
            .with_id(ChangeSetId::generate());

        for conflict in &mut change_set.conflicts {
            conflict.proposed = Some(self.resolver.resolve(conflict));
        }

        machine.advance(RunState::PreviewReady)?;
        self.cache_preview(&change_set);

        info!(
            change_set_id = %change_set.id,
            list_tasks = list_tasks.len(),
            doc_tasks = doc_tasks.len(),
            creates = change_set.creates.len(),
            updates = change_set.updates.len(),
            conflicts = change_set.conflicts.len(),
            deletes = change_set.deletes.len(),
            invalid = change_set.invalid.len(),
            "Preview ready"
        );
        Ok(change_set)
    }

    /// Claim the apply slot without starting a run
    ///
    /// Fails with `RunInProgress` when an apply of this orchestrator, or of
    /// any other process sharing the ledger, holds it.
    pub fn try_begin_apply(&self) -> Result<ApplySlot> {
        let guard = self
            .apply_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| TaskSyncError::RunInProgress)?;

        let run_id = RunId::generate();
        if !self
            .ledger
            .try_acquire_run(&run_id, self.settings.run_lock_timeout)?
        {
            info!(run_id = %run_id, "Another process is applying");
            return Err(TaskSyncError::RunInProgress);
        }

        self.set_state(RunState::Applying);
        metrics::set_apply_in_progress(true);
        Ok(ApplySlot {
            run_id,
            ledger: self.ledger.clone(),
            state: self.apply_state.clone(),
            _guard: guard,
        })
    }

    /// Apply a previewed change set by id
    pub async fn apply_by_id(
        &self,
        id: &ChangeSetId,
        selections: &Selections,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let change_set = self
            .cached_preview(id)
            .ok_or_else(|| TaskSyncError::NotFound(format!("change set {}", id)))?;
        let slot = self.try_begin_apply()?;
        self.apply_claimed(slot, &change_set, selections, cancel).await
    }

    /// Apply a previewed change set by id in an already claimed slot
    pub async fn apply_by_id_in(
        &self,
        slot: ApplySlot,
        id: &ChangeSetId,
        selections: &Selections,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let change_set = self
            .cached_preview(id)
            .ok_or_else(|| TaskSyncError::NotFound(format!("change set {}", id)))?;
        self.apply_claimed(slot, &change_set, selections, cancel).await
    }

    async fn apply_claimed(
        &self,
        slot: ApplySlot,
        change_set: &ChangeSet,
        selections: &Selections,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let report = self.apply_in(slot, change_set, selections, cancel).await?;
        self.forget_preview(&change_set.id);
        Ok(report)
    }

    /// Apply the selected items of a change set
    ///
    /// Per-item failures are recorded and never stop the batch. Fatal
    /// errors (credentials, ledger) finish the run as `Aborted` with the
    /// remaining items skipped. Fails with `RunInProgress` when the slot is
    /// taken, or with the ledger error if the slot cannot be claimed.
    pub async fn apply(
        &self,
        change_set: &ChangeSet,
        selections: &Selections,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let slot = self.try_begin_apply()?;
        self.apply_in(slot, change_set, selections, cancel).await
    }

    /// Apply in a slot claimed earlier with `try_begin_apply`
    ///
    /// The slot is released when the run finishes.
    pub async fn apply_in(
        &self,
        slot: ApplySlot,
        change_set: &ChangeSet,
        selections: &Selections,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        if !Arc::ptr_eq(&slot.state, &self.apply_state) {
            return Err(TaskSyncError::Validation(
                "apply slot belongs to another orchestrator".to_string(),
            ));
        }

        let mut machine = RunStateMachine::new();
        machine.advance(RunState::Applying)?;
        let report = self
            .run_apply(slot.run_id().clone(), change_set, selections, cancel, &mut machine)
            .await;
        machine.advance(RunState::Idle)?;
        drop(slot);
        Ok(report)
    }

    async fn run_apply(
        &self,
        run_id: RunId,
        change_set: &ChangeSet,
        selections: &Selections,
        cancel: &CancelToken,
        machine: &mut RunStateMachine,
    ) -> SyncReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let planned = plan(change_set);

        let preset: Vec<Option<ItemOutcome>> =
            planned.iter().map(|p| self.preset_outcome(p, selections)).collect();
        let ctx = RunContext {
            run_id,
            cancel,
            abort_reason: Mutex::new(None),
            cancelled_items: AtomicBool::new(false),
            executable: preset.iter().filter(|p| p.is_none()).count(),
            finished: AtomicUsize::new(0),
            seen_projects: Mutex::new(HashSet::new()),
        };

        info!(
            run_id = %ctx.run_id,
            change_set_id = %change_set.id,
            items = planned.len(),
            executable = ctx.executable,
            "Starting apply"
        );

        self.validate_run(&ctx, change_set);

        let pending: Vec<_> = planned
            .iter()
            .copied()
            .zip(preset)
            .map(|(item, preset)| self.process(&ctx, item, preset))
            .collect();
        let outcomes: Vec<ItemOutcome> = stream::iter(pending)
            .buffered(self.settings.max_workers)
            .collect()
            .await;

        machine.advance(RunState::Finalizing).ok();

        let items: Vec<ItemReport> = planned
            .iter()
            .zip(outcomes)
            .map(|(item, outcome)| {
                metrics::record_item(outcome.label());
                ItemReport {
                    step_id: item.step_id().clone(),
                    action: item.action(),
                    title: item.title(),
                    target: item.target(),
                    outcome,
                }
            })
            .collect();

        let outcome = match ctx.aborted() {
            Some(reason) => {
                machine.abort();
                RunOutcome::Aborted { reason }
            }
            None if ctx.cancelled_items.load(Ordering::SeqCst) => RunOutcome::Cancelled,
            None => RunOutcome::Completed,
        };

        let elapsed = clock.elapsed();
        let report = SyncReport {
            run_id: ctx.run_id.clone(),
            change_set_id: change_set.id.clone(),
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: elapsed.as_millis() as u64,
            outcome,
            totals: RunTotals::from_items(&items),
            items,
        };

        if let Err(e) = self
            .ledger
            .record_report(&report, self.settings.history_limit)
        {
            error!(run_id = %report.run_id, error = %e, "Failed to record run history");
        }

        metrics::record_run(report.outcome.label(), elapsed.as_secs_f64());
        self.events.emit(SyncEvent::RunCompleted(RunSummary {
            run_id: report.run_id.clone(),
            totals: report.totals,
            elapsed_ms: report.elapsed_ms,
            outcome: report.outcome.clone(),
        }));

        info!(
            run_id = %report.run_id,
            outcome = report.outcome.label(),
            applied = report.totals.total_applied,
            failed = report.totals.total_failed,
            skipped = report.totals.total_skipped,
            deferred = report.totals.total_deferred,
            elapsed_ms = report.elapsed_ms,
            "Apply finished"
        );
        report
    }

    /// Outcome decided without touching a backend, `None` if the item runs
    fn preset_outcome(&self, item: &Planned<'_>, selections: &Selections) -> Option<ItemOutcome> {
        match item {
            Planned::Invalid(invalid) => Some(ItemOutcome::skipped(format!(
                "validation failed: {}",
                invalid.reason
            ))),
            Planned::Conflict(conflict) => {
                let resolution = conflict
                    .proposed
                    .clone()
                    .unwrap_or_else(|| self.resolver.resolve(conflict));
                match resolution {
                    Resolution::Defer(reason) => Some(ItemOutcome::Deferred { reason }),
                    _ if !selections.includes(&conflict.step_id) => {
                        Some(ItemOutcome::skipped("not selected"))
                    }
                    _ => None,
                }
            }
            other if !selections.includes(other.step_id()) => {
                Some(ItemOutcome::skipped("not selected"))
            }
            _ => None,
        }
    }

    /// Opening step: the ledger must be readable and its links writable
    fn validate_run(&self, ctx: &RunContext<'_>, change_set: &ChangeSet) {
        let step_id = StepId::new(VALIDATION_STEP);
        self.events.step(
            StepEvent::new(step_id.clone(), StepKind::Started, ItemType::Validation)
                .with_progress(0),
        );

        let checked = self.ledger.all_links().and_then(|_| {
            for link in &change_set.ledger_refreshes {
                let mut refreshed = link.clone();
                refreshed.last_synced_at = Utc::now();
                self.ledger.upsert(&refreshed)?;
            }
            Ok(())
        });

        match checked {
            Ok(()) => self.events.step(
                StepEvent::new(step_id, StepKind::Completed, ItemType::Validation)
                    .with_progress(0)
                    .with_detail(format!(
                        "{} items to apply, {} links refreshed",
                        ctx.executable,
                        change_set.ledger_refreshes.len()
                    )),
            ),
            Err(e) => {
                error!(run_id = %ctx.run_id, error = %e, "Ledger unavailable, aborting run");
                self.events.step(
                    StepEvent::new(step_id, StepKind::Failed, ItemType::Validation)
                        .with_detail(e.to_string()),
                );
                ctx.abort(format!("ledger unavailable: {}", e));
            }
        }
    }

    async fn process(
        &self,
        ctx: &RunContext<'_>,
        item: Planned<'_>,
        preset: Option<ItemOutcome>,
    ) -> ItemOutcome {
        if let Some(outcome) = preset {
            return outcome;
        }
        if let Some(reason) = ctx.aborted() {
            return ItemOutcome::skipped(format!("run aborted: {}", reason));
        }
        if ctx.cancel.is_cancelled() {
            ctx.cancelled_items.store(true, Ordering::SeqCst);
            return ItemOutcome::skipped("run cancelled");
        }

        let step_id = item.step_id().clone();
        debug!(run_id = %ctx.run_id, step_id = %step_id, "Item started");
        self.events.step(StepEvent::new(
            step_id.clone(),
            StepKind::Started,
            ItemType::Task,
        ));

        let result = match item {
            Planned::Create(create) => self.apply_create(ctx, create).await,
            Planned::Update(update) => self.apply_update(ctx, update).await,
            Planned::Conflict(conflict) => self.apply_conflict(ctx, conflict).await,
            Planned::Delete(delete) => self.apply_delete(delete).await,
            Planned::Invalid(invalid) => Ok(ItemOutcome::skipped(invalid.reason.clone())),
        };

        let pct = ctx.finish_one();
        match result {
            Ok(outcome) => {
                let detail = match outcome {
                    ItemOutcome::Applied => item.title(),
                    ItemOutcome::Skipped { ref reason } | ItemOutcome::Deferred { ref reason } => {
                        reason.clone()
                    }
                    ItemOutcome::Failed { ref error, .. } => error.clone(),
                };
                self.events.step(
                    StepEvent::new(step_id, StepKind::Completed, ItemType::Task)
                        .with_progress(pct)
                        .with_detail(detail),
                );
                outcome
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(run_id = %ctx.run_id, step_id = %step_id, error = %e, "Fatal error, aborting run");
                    ctx.abort(e.to_string());
                } else {
                    warn!(run_id = %ctx.run_id, step_id = %step_id, error = %e, "Item failed");
                }
                self.events.step(
                    StepEvent::new(step_id, StepKind::Failed, ItemType::Task)
                        .with_progress(pct)
                        .with_detail(e.to_string()),
                );
                ItemOutcome::failed(&e)
            }
        }
    }

    fn announce_project(&self, ctx: &RunContext<'_>, fields: &TaskFields) {
        if let Some(ref project) = fields.project_ref {
            if !project.trim().is_empty() && ctx.first_sighting(project) {
                self.events.step(
                    StepEvent::new(
                        StepId::new(format!("project:{}", project)),
                        StepKind::Progress,
                        ItemType::Project,
                    )
                    .with_detail(format!("project {}", project)),
                );
            }
        }
    }

    async fn apply_create(&self, ctx: &RunContext<'_>, item: &CreateItem) -> Result<ItemOutcome> {
        let source = &item.task;
        if self
            .ledger
            .find_by_native_ref(source.source_system, &source.id)?
            .is_some()
        {
            return Ok(ItemOutcome::skipped("already linked"));
        }

        let fields = source.fields();
        self.announce_project(ctx, &fields);
        let created = self.create_on(item.target, &fields).await?;

        let link = match source.source_system {
            SourceSystem::ListService => SyncLink::between(source, &created, Utc::now()),
            SourceSystem::DocStore => SyncLink::between(&created, source, Utc::now()),
        };
        if let Err(e) = self.ledger.upsert(&link) {
            // an unlinked counterpart would be copied back on the next run
            self.discard_created(item.target, &created.id).await;
            return Err(e);
        }
        debug!(link_id = %link.link_id, native_id = %created.id, system = %item.target, "Created counterpart");
        Ok(ItemOutcome::Applied)
    }

    async fn discard_created(&self, system: SourceSystem, id: &NativeId) {
        match self.delete_on(system, id).await {
            Ok(()) | Err(TaskSyncError::NotFound(_)) => {
                warn!(native_id = %id, system = %system, "Link not recorded, removed the new task");
            }
            Err(e) => {
                error!(native_id = %id, system = %system, error = %e, "Link not recorded and the new task could not be removed");
            }
        }
    }

    /// Write the changed fields of an update and record the new revisions
    async fn write_update(&self, item: &UpdateItem) -> Result<()> {
        let patch = TaskPatch::from_fields(&item.source.fields(), &item.changed_fields)
            .with_expected_revision(item.counterpart.revision.marker.clone());
        let updated = self
            .update_on(item.target, &item.counterpart.id, &patch)
            .await?;

        let (list_rev, doc_rev) = match item.target {
            SourceSystem::DocStore => (&item.source.revision.marker, &updated.revision.marker),
            SourceSystem::ListService => (&updated.revision.marker, &item.source.revision.marker),
        };
        let mut link = item.link.clone();
        link.mark_synced(list_rev.clone(), doc_rev.clone(), updated.fields(), Utc::now());
        self.ledger.upsert(&link)?;
        Ok(())
    }

    async fn apply_update(&self, ctx: &RunContext<'_>, item: &UpdateItem) -> Result<ItemOutcome> {
        match self.write_update(item).await {
            Ok(()) => Ok(ItemOutcome::Applied),
            Err(e) if e.is_conflict() => {
                info!(step_id = %item.step_id, "Revision moved during update, re-diffing");
                self.retry_after_conflict(ctx, &item.step_id, &item.link).await
            }
            Err(e) => Err(e),
        }
    }

    /// Write a non-deferred resolution to whichever sides need it
    async fn write_resolution(
        &self,
        ctx: &RunContext<'_>,
        conflict: &ConflictItem,
        resolution: &Resolution,
    ) -> Result<Option<String>> {
        let merged = match resolution.merged_fields(conflict) {
            Some(fields) => fields,
            None => {
                let reason = match resolution {
                    Resolution::Defer(reason) => reason.clone(),
                    _ => "deferred".to_string(),
                };
                return Ok(Some(reason));
            }
        };

        let mut list_task = conflict.list_task.clone();
        let mut doc_task = conflict.doc_task.clone();

        let list_fields = list_task.fields().diff(&merged);
        let doc_fields = doc_task.fields().diff(&merged);
        let writes = usize::from(!list_fields.is_empty()) + usize::from(!doc_fields.is_empty());

        if !list_fields.is_empty() {
            list_task = self
                .write_fields(&list_task, &merged, &list_fields)
                .await?;
        }
        if writes == 2 {
            self.events.step(
                StepEvent::new(conflict.step_id.clone(), StepKind::Progress, ItemType::Task)
                    .with_progress(50)
                    .with_detail("list service side written"),
            );
        }
        if !doc_fields.is_empty() {
            self.announce_project(ctx, &merged);
            doc_task = self.write_fields(&doc_task, &merged, &doc_fields).await?;
        }

        let link = match conflict.link {
            Some(ref existing) => {
                let mut link = existing.clone();
                link.mark_synced(
                    list_task.revision.marker.clone(),
                    doc_task.revision.marker.clone(),
                    merged,
                    Utc::now(),
                );
                link
            }
            None => {
                let mut link = SyncLink::between(&list_task, &doc_task, Utc::now());
                link.snapshot = Some(merged);
                link
            }
        };
        self.ledger.upsert(&link)?;
        Ok(None)
    }

    async fn write_fields(&self, task: &Task, merged: &TaskFields, fields: &[Field]) -> Result<Task> {
        let patch = TaskPatch::from_fields(merged, fields)
            .with_expected_revision(task.revision.marker.clone());
        self.update_on(task.source_system, &task.id, &patch).await
    }

    async fn apply_conflict(
        &self,
        ctx: &RunContext<'_>,
        item: &ConflictItem,
    ) -> Result<ItemOutcome> {
        let resolution = item
            .proposed
            .clone()
            .unwrap_or_else(|| self.resolver.resolve(item));

        match self.write_resolution(ctx, item, &resolution).await {
            Ok(None) => Ok(ItemOutcome::Applied),
            Ok(Some(reason)) => Ok(ItemOutcome::Deferred { reason }),
            Err(e) if e.is_conflict() => match item.link {
                Some(ref link) => {
                    info!(step_id = %item.step_id, "Revision moved during resolution, re-diffing");
                    self.retry_after_conflict(ctx, &item.step_id, link).await
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Re-fetch a pair after a lost optimistic-lock race, re-diff it alone
    /// and try once more. A second failure is returned to the caller.
    async fn retry_after_conflict(
        &self,
        ctx: &RunContext<'_>,
        step_id: &StepId,
        link: &SyncLink,
    ) -> Result<ItemOutcome> {
        let (list_now, doc_now) = tokio::join!(
            self.fetch_one(SourceSystem::ListService, &link.list_service_ref),
            self.fetch_one(SourceSystem::DocStore, &link.doc_store_ref)
        );
        let (list_now, doc_now) = match (list_now?, doc_now?) {
            (Some(l), Some(d)) => (l, d),
            _ => {
                return Err(TaskSyncError::NotFound(format!(
                    "a task of link {} disappeared during apply",
                    link.link_id
                )))
            }
        };

        let link = self.ledger.get(&link.link_id)?.unwrap_or_else(|| link.clone());
        match diff_pair(&list_now, &doc_now, &link) {
            PairDiff::Unchanged => Ok(ItemOutcome::skipped("already in sync")),
            PairDiff::Refresh(mut refreshed) => {
                refreshed.last_synced_at = Utc::now();
                self.ledger.upsert(&refreshed)?;
                Ok(ItemOutcome::skipped("already in sync"))
            }
            PairDiff::Update(update) => {
                debug!(step_id = %step_id, target = %update.target, "Retrying as update");
                self.write_update(&update).await?;
                Ok(ItemOutcome::Applied)
            }
            PairDiff::Conflict(conflict) => {
                let resolution = self.resolver.resolve(&conflict);
                debug!(step_id = %step_id, ?resolution, "Retrying as conflict resolution");
                match self.write_resolution(ctx, &conflict, &resolution).await? {
                    None => Ok(ItemOutcome::Applied),
                    Some(reason) => Ok(ItemOutcome::Deferred { reason }),
                }
            }
        }
    }

    async fn apply_delete(&self, item: &DeleteItem) -> Result<ItemOutcome> {
        if let Some(ref survivor) = item.counterpart {
            let system = survivor.source_system;
            match self.settings.delete_mode {
                DeleteMode::Complete if survivor.completed => {}
                DeleteMode::Complete => {
                    self.update_on(system, &survivor.id, &TaskPatch::complete())
                        .await?;
                }
                DeleteMode::Hard => match self.delete_on(system, &survivor.id).await {
                    Ok(()) | Err(TaskSyncError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                },
            }
            debug!(native_id = %survivor.id, system = %system, mode = ?self.settings.delete_mode, "Propagated delete");
        }

        self.ledger.remove(&item.link.link_id)?;
        Ok(ItemOutcome::Applied)
    }
}
