//! Sync ledger
//!
//! Persists the `SyncLink` set (one link per linked pair, 1:1 on both
//! sides) plus the history of apply reports.
//!
//! - **sqlite**: durable store used by the CLI and server
//! - **memory**: in-process store for tests and demos
//!
//! Every write is atomic: readers never see a half-written link.
//!
//! The ledger also owns the apply slot. Every process that syncs through the
//! same store competes for it, so only one run is applying at a time.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::{LedgerConfig, SqliteLedger};

use crate::model::{LinkId, NativeId, RunId, SourceSystem, SyncLink};
use crate::sync::SyncReport;
use crate::{Result, TaskSyncError};
use std::time::Duration;

/// Storage contract for links and run history
pub trait LedgerStore: Send + Sync {
    fn get(&self, link_id: &LinkId) -> Result<Option<SyncLink>>;

    /// Link holding `native_id` on the given side
    fn find_by_native_ref(
        &self,
        system: SourceSystem,
        native_id: &NativeId,
    ) -> Result<Option<SyncLink>>;

    /// Insert or replace a link
    ///
    /// Fails with `Validation` when another link already claims either
    /// native id.
    fn upsert(&self, link: &SyncLink) -> Result<()>;

    fn remove(&self, link_id: &LinkId) -> Result<()>;

    /// Every link, in insertion order
    fn all_links(&self) -> Result<Vec<SyncLink>>;

    /// Append a report, keeping at most `keep` reports
    fn record_report(&self, report: &SyncReport, keep: usize) -> Result<()>;

    /// Stored reports, most recent first
    fn history(&self, limit: usize) -> Result<Vec<SyncReport>>;

    /// Claim the apply slot for `run_id`
    ///
    /// Returns `false` while another run holds it. A claim older than
    /// `stale_after` belongs to a crashed run and is taken over.
    fn try_acquire_run(&self, run_id: &RunId, stale_after: Duration) -> Result<bool>;

    /// Give the slot back if `run_id` still holds it
    fn release_run(&self, run_id: &RunId) -> Result<()>;
}

/// Error for a link that would break the 1:1 mapping
pub(crate) fn duplicate_ref_error(
    system: SourceSystem,
    native_id: &NativeId,
    owner: &LinkId,
) -> TaskSyncError {
    TaskSyncError::Validation(format!(
        "{} task {} is already linked by {}",
        system, native_id, owner
    ))
}
