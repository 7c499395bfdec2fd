//! In-memory ledger

use super::{duplicate_ref_error, LedgerStore};
use crate::model::{LinkId, NativeId, RunId, SourceSystem, SyncLink};
use crate::sync::SyncReport;
use crate::{Result, TaskSyncError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LedgerState {
    links: Vec<SyncLink>,
    reports: VecDeque<SyncReport>,
    run_holder: Option<(RunId, Instant)>,
}

/// Ledger kept in process memory
///
/// Can be switched to "unavailable" to simulate a store outage, or made to
/// reject link writes only.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    unavailable: AtomicBool,
    reject_upserts: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a storage error (or recover)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `upsert` fail with a storage error while reads keep working
    pub fn set_reject_upserts(&self, reject: bool) {
        self.reject_upserts.store(reject, Ordering::SeqCst);
    }

    /// Run currently holding the apply slot
    pub fn run_holder(&self) -> Option<RunId> {
        self.read(|s| s.run_holder.as_ref().map(|(id, _)| id.clone()))
            .ok()
            .flatten()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TaskSyncError::Storage("ledger unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> Result<T> {
        self.check()?;
        let state = self
            .state
            .read()
            .map_err(|_| TaskSyncError::Storage("ledger lock poisoned".to_string()))?;
        Ok(f(&state))
    }

    fn write<T>(&self, f: impl FnOnce(&mut LedgerState) -> Result<T>) -> Result<T> {
        self.check()?;
        let mut state = self
            .state
            .write()
            .map_err(|_| TaskSyncError::Storage("ledger lock poisoned".to_string()))?;
        f(&mut state)
    }
}

impl LedgerStore for MemoryLedger {
    fn get(&self, link_id: &LinkId) -> Result<Option<SyncLink>> {
        self.read(|s| s.links.iter().find(|l| &l.link_id == link_id).cloned())
    }

    fn find_by_native_ref(
        &self,
        system: SourceSystem,
        native_id: &NativeId,
    ) -> Result<Option<SyncLink>> {
        self.read(|s| {
            s.links
                .iter()
                .find(|l| l.native_ref(system) == native_id)
                .cloned()
        })
    }

    fn upsert(&self, link: &SyncLink) -> Result<()> {
        if self.reject_upserts.load(Ordering::SeqCst) {
            return Err(TaskSyncError::Storage("ledger rejected link write".to_string()));
        }
        self.write(|s| {
            for system in [SourceSystem::ListService, SourceSystem::DocStore] {
                let native_id = link.native_ref(system);
                if let Some(owner) = s
                    .links
                    .iter()
                    .find(|l| l.link_id != link.link_id && l.native_ref(system) == native_id)
                {
                    return Err(duplicate_ref_error(system, native_id, &owner.link_id));
                }
            }

            match s.links.iter_mut().find(|l| l.link_id == link.link_id) {
                Some(existing) => *existing = link.clone(),
                None => s.links.push(link.clone()),
            }
            Ok(())
        })
    }

    fn remove(&self, link_id: &LinkId) -> Result<()> {
        self.write(|s| {
            s.links.retain(|l| &l.link_id != link_id);
            Ok(())
        })
    }

    fn all_links(&self) -> Result<Vec<SyncLink>> {
        self.read(|s| s.links.clone())
    }

    fn record_report(&self, report: &SyncReport, keep: usize) -> Result<()> {
        self.write(|s| {
            s.reports.push_front(report.clone());
            s.reports.truncate(keep);
            Ok(())
        })
    }

    fn history(&self, limit: usize) -> Result<Vec<SyncReport>> {
        self.read(|s| s.reports.iter().take(limit).cloned().collect())
    }

    fn try_acquire_run(&self, run_id: &RunId, stale_after: Duration) -> Result<bool> {
        self.write(|s| {
            let free = match s.run_holder {
                Some((ref holder, since)) => holder == run_id || since.elapsed() >= stale_after,
                None => true,
            };
            if free {
                s.run_holder = Some((run_id.clone(), Instant::now()));
            }
            Ok(free)
        })
    }

    fn release_run(&self, run_id: &RunId) -> Result<()> {
        self.write(|s| {
            if matches!(s.run_holder, Some((ref holder, _)) if holder == run_id) {
                s.run_holder = None;
            }
            Ok(())
        })
    }
}
