//! In-process backend
//!
//! Keeps tasks in memory with per-backend revision counters and honors
//! optimistic locking the way the real APIs do. Faults can be injected per
//! operation and task to exercise retry, conflict and abort paths.

use super::{Connector, TaskFilter};
use crate::model::{NativeId, Revision, SourceSystem, Task, TaskFields, TaskPatch};
use crate::{Result, TaskSyncError};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Base of the synthetic modification clock, in seconds since the epoch
const CLOCK_BASE: i64 = 1_700_000_000;

/// Operation a fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    FetchAll,
    FetchOne,
    Create,
    Update,
    Delete,
}

/// Error raised by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Auth,
    Conflict,
    Validation,
}

impl FaultKind {
    fn to_error(self, system: SourceSystem, key: &str) -> TaskSyncError {
        match self {
            FaultKind::Transient => {
                TaskSyncError::Transient(format!("{} unavailable (injected)", system))
            }
            FaultKind::Auth => TaskSyncError::Auth(format!("{} token rejected (injected)", system)),
            FaultKind::Conflict => TaskSyncError::conflict(key, "revision mismatch (injected)"),
            FaultKind::Validation => {
                TaskSyncError::Validation(format!("{} rejected {} (injected)", system, key))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Fault {
    op: FaultOp,
    /// Native id, or title for creates; `*` matches anything
    key: String,
    kind: FaultKind,
    /// Remaining occurrences; `None` fails forever
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: Vec<Task>,
    clock: i64,
    next_id: u64,
    faults: Vec<Fault>,
    calls: Vec<FaultOp>,
}

impl MemoryState {
    fn next_revision(&mut self, prefix: &str) -> Revision {
        self.clock += 1;
        let at = Utc
            .timestamp_opt(CLOCK_BASE + self.clock, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Revision::new(format!("{}{}", prefix, self.clock)).with_modified_at(at)
    }

    fn position(&self, id: &NativeId) -> Option<usize> {
        self.tasks.iter().position(|t| &t.id == id)
    }

    fn take_fault(&mut self, op: FaultOp, key: &str) -> Option<FaultKind> {
        self.calls.push(op);
        let idx = self
            .faults
            .iter()
            .position(|f| f.op == op && (f.key == "*" || f.key == key))?;
        let kind = self.faults[idx].kind;
        match self.faults[idx].remaining {
            Some(n) if n <= 1 => {
                self.faults.remove(idx);
            }
            Some(n) => self.faults[idx].remaining = Some(n - 1),
            None => {}
        }
        Some(kind)
    }
}

/// In-memory task backend
pub struct MemoryConnector {
    system: SourceSystem,
    state: Mutex<MemoryState>,
}

impl MemoryConnector {
    pub fn new(system: SourceSystem) -> Self {
        Self {
            system,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn prefix(&self) -> &'static str {
        match self.system {
            SourceSystem::ListService => "r",
            SourceSystem::DocStore => "e",
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TaskSyncError::Other(format!("{} memory backend poisoned", self.system)))
    }

    fn check_fault(&self, state: &mut MemoryState, op: FaultOp, key: &str) -> Result<()> {
        match state.take_fault(op, key) {
            Some(kind) => {
                debug!(system = %self.system, ?op, key, ?kind, "Injected fault");
                Err(kind.to_error(self.system, key))
            }
            None => Ok(()),
        }
    }

    /// Seed a task as if a user created it in the backend
    pub fn add_task(&self, id: impl Into<NativeId>, fields: TaskFields) -> Result<Task> {
        let mut state = self.lock()?;
        let revision = state.next_revision(self.prefix());
        let task = Task::from_fields(id, self.system, fields, revision);
        state.tasks.push(task.clone());
        Ok(task)
    }

    /// Edit a task out-of-band, bumping its revision
    pub fn touch(&self, id: &str, edit: impl FnOnce(&mut TaskFields)) -> Result<Task> {
        let mut state = self.lock()?;
        let id = NativeId::new(id);
        let idx = state
            .position(&id)
            .ok_or_else(|| TaskSyncError::NotFound(format!("{} {}", self.system, id)))?;
        let revision = state.next_revision(self.prefix());
        let mut fields = state.tasks[idx].fields();
        edit(&mut fields);
        let task = Task::from_fields(id, self.system, fields, revision);
        state.tasks[idx] = task.clone();
        Ok(task)
    }

    /// Delete a task out-of-band
    pub fn remove_task(&self, id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let id = NativeId::new(id);
        state.tasks.retain(|t| t.id != id);
        Ok(())
    }

    /// Fail the next `times` calls of `op` on `key` (native id, or title for
    /// creates, or `*`). `None` fails every call.
    pub fn inject_fault(&self, op: FaultOp, key: &str, kind: FaultKind, times: Option<u32>) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push(Fault {
                op,
                key: key.to_string(),
                kind,
                remaining: times,
            });
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.clear();
        }
    }

    /// Snapshot of every stored task, in insertion order
    pub fn tasks(&self) -> Vec<Task> {
        self.state
            .lock()
            .map(|s| s.tasks.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        let id = NativeId::new(id);
        self.state
            .lock()
            .ok()
            .and_then(|s| s.tasks.iter().find(|t| t.id == id).cloned())
    }

    /// Number of calls made for an operation, including failed ones
    pub fn call_count(&self, op: FaultOp) -> usize {
        self.state
            .lock()
            .map(|s| s.calls.iter().filter(|c| **c == op).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn system(&self) -> SourceSystem {
        self.system
    }

    async fn fetch_all(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut state = self.lock()?;
        self.check_fault(&mut state, FaultOp::FetchAll, "*")?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn fetch_one(&self, id: &NativeId) -> Result<Option<Task>> {
        let mut state = self.lock()?;
        self.check_fault(&mut state, FaultOp::FetchOne, id.as_str())?;
        Ok(state.position(id).map(|idx| state.tasks[idx].clone()))
    }

    async fn create(&self, fields: &TaskFields) -> Result<Task> {
        let mut state = self.lock()?;
        self.check_fault(&mut state, FaultOp::Create, &fields.title)?;
        state.next_id += 1;
        let id = format!("{}-{}", self.system.as_str(), state.next_id);
        let revision = state.next_revision(self.prefix());
        let task = Task::from_fields(id, self.system, fields.clone(), revision);
        state.tasks.push(task.clone());
        Ok(task)
    }

    async fn update(&self, id: &NativeId, patch: &TaskPatch) -> Result<Task> {
        let mut state = self.lock()?;
        self.check_fault(&mut state, FaultOp::Update, id.as_str())?;
        let idx = state
            .position(id)
            .ok_or_else(|| TaskSyncError::NotFound(format!("{} {}", self.system, id)))?;

        if let Some(ref expected) = patch.expected_revision {
            let current = &state.tasks[idx].revision.marker;
            if current != expected {
                return Err(TaskSyncError::conflict(
                    id.as_str(),
                    format!("expected revision {}, found {}", expected, current),
                ));
            }
        }

        let mut fields = state.tasks[idx].fields();
        patch.apply_to(&mut fields);
        let revision = state.next_revision(self.prefix());
        let task = Task::from_fields(id.clone(), self.system, fields, revision);
        state.tasks[idx] = task.clone();
        Ok(task)
    }

    async fn delete(&self, id: &NativeId) -> Result<()> {
        let mut state = self.lock()?;
        self.check_fault(&mut state, FaultOp::Delete, id.as_str())?;
        let idx = state
            .position(id)
            .ok_or_else(|| TaskSyncError::NotFound(format!("{} {}", self.system, id)))?;
        state.tasks.remove(idx);
        Ok(())
    }
}
