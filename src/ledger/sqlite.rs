//! SQLite ledger implementation

use super::{duplicate_ref_error, LedgerStore};
use crate::model::{LinkId, NativeId, RunId, SourceSystem, SyncLink, TaskFields};
use crate::sync::SyncReport;
use crate::{Result, TaskSyncError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a write waits for another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ledger database configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Path to SQLite database file
    pub path: PathBuf,

    /// Enable WAL mode so previews can read while an apply writes
    pub wal_mode: bool,
}

impl LedgerConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wal_mode: true,
        }
    }
}

/// SQLite-backed ledger
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

const LINK_COLUMNS: &str = "link_id, list_ref, doc_ref, list_revision, doc_revision, synced_at, snapshot";

impl SqliteLedger {
    /// Open or create a ledger database
    pub fn open(config: LedgerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %config.path.display(), "Opening ledger database");

        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    /// Private in-memory database, for tests
    pub fn in_memory() -> Result<Self> {
        let ledger = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TaskSyncError::Storage("ledger connection poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_links (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                link_id TEXT NOT NULL UNIQUE,
                list_ref TEXT NOT NULL UNIQUE,
                doc_ref TEXT NOT NULL UNIQUE,
                list_revision TEXT NOT NULL,
                doc_revision TEXT NOT NULL,
                synced_at TEXT NOT NULL,
                snapshot TEXT
            );

            CREATE TABLE IF NOT EXISTS sync_reports (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                started_at TEXT NOT NULL,
                report TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_lock (
                slot INTEGER PRIMARY KEY CHECK (slot = 1),
                run_id TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn row_to_link(row: &Row<'_>) -> rusqlite::Result<RawLink> {
        Ok(RawLink {
            link_id: row.get(0)?,
            list_ref: row.get(1)?,
            doc_ref: row.get(2)?,
            list_revision: row.get(3)?,
            doc_revision: row.get(4)?,
            synced_at: row.get(5)?,
            snapshot: row.get(6)?,
        })
    }

    fn query_one(&self, where_clause: &str, value: &str) -> Result<Option<SyncLink>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM sync_links WHERE {} = ?1", LINK_COLUMNS, where_clause);
        let raw = conn
            .query_row(&sql, params![value], Self::row_to_link)
            .optional()?;
        raw.map(RawLink::into_link).transpose()
    }
}

/// Link as stored, before parsing
struct RawLink {
    link_id: String,
    list_ref: String,
    doc_ref: String,
    list_revision: String,
    doc_revision: String,
    synced_at: String,
    snapshot: Option<String>,
}

impl RawLink {
    fn into_link(self) -> Result<SyncLink> {
        let last_synced_at = DateTime::parse_from_rfc3339(&self.synced_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                TaskSyncError::Storage(format!("bad synced_at for {}: {}", self.link_id, e))
            })?;
        let snapshot = match self.snapshot {
            Some(ref json) => Some(serde_json::from_str::<TaskFields>(json)?),
            None => None,
        };
        Ok(SyncLink {
            link_id: LinkId::new(self.link_id),
            list_service_ref: NativeId::new(self.list_ref),
            doc_store_ref: NativeId::new(self.doc_ref),
            last_synced_revision_list: self.list_revision,
            last_synced_revision_doc: self.doc_revision,
            last_synced_at,
            snapshot,
        })
    }
}

impl LedgerStore for SqliteLedger {
    fn get(&self, link_id: &LinkId) -> Result<Option<SyncLink>> {
        self.query_one("link_id", link_id.as_str())
    }

    fn find_by_native_ref(
        &self,
        system: SourceSystem,
        native_id: &NativeId,
    ) -> Result<Option<SyncLink>> {
        let column = match system {
            SourceSystem::ListService => "list_ref",
            SourceSystem::DocStore => "doc_ref",
        };
        self.query_one(column, native_id.as_str())
    }

    fn upsert(&self, link: &SyncLink) -> Result<()> {
        let snapshot = link
            .snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        for (system, column, native_id) in [
            (SourceSystem::ListService, "list_ref", &link.list_service_ref),
            (SourceSystem::DocStore, "doc_ref", &link.doc_store_ref),
        ] {
            let owner: Option<String> = tx
                .query_row(
                    &format!(
                        "SELECT link_id FROM sync_links WHERE {} = ?1 AND link_id != ?2",
                        column
                    ),
                    params![native_id.as_str(), link.link_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(owner) = owner {
                return Err(duplicate_ref_error(system, native_id, &LinkId::new(owner)));
            }
        }

        tx.execute(
            r#"
            INSERT INTO sync_links (link_id, list_ref, doc_ref, list_revision, doc_revision, synced_at, snapshot)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(link_id) DO UPDATE SET
                list_ref = excluded.list_ref,
                doc_ref = excluded.doc_ref,
                list_revision = excluded.list_revision,
                doc_revision = excluded.doc_revision,
                synced_at = excluded.synced_at,
                snapshot = excluded.snapshot
            "#,
            params![
                link.link_id.as_str(),
                link.list_service_ref.as_str(),
                link.doc_store_ref.as_str(),
                link.last_synced_revision_list,
                link.last_synced_revision_doc,
                link.last_synced_at.to_rfc3339(),
                snapshot,
            ],
        )?;
        tx.commit()?;

        tracing::debug!(link_id = %link.link_id, "Upserted link");
        Ok(())
    }

    fn remove(&self, link_id: &LinkId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sync_links WHERE link_id = ?1",
            params![link_id.as_str()],
        )?;
        tracing::debug!(link_id = %link_id, "Removed link");
        Ok(())
    }

    fn all_links(&self) -> Result<Vec<SyncLink>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_links ORDER BY seq",
            LINK_COLUMNS
        ))?;
        let raws = stmt
            .query_map([], Self::row_to_link)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawLink::into_link).collect()
    }

    fn record_report(&self, report: &SyncReport, keep: usize) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO sync_reports (run_id, started_at, report) VALUES (?1, ?2, ?3)",
            params![report.run_id.as_str(), report.started_at.to_rfc3339(), json],
        )?;
        tx.execute(
            r#"
            DELETE FROM sync_reports WHERE seq NOT IN (
                SELECT seq FROM sync_reports ORDER BY seq DESC LIMIT ?1
            )
            "#,
            params![keep as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn history(&self, limit: usize) -> Result<Vec<SyncReport>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT report FROM sync_reports ORDER BY seq DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(TaskSyncError::from))
            .collect()
    }

    fn try_acquire_run(&self, run_id: &RunId, stale_after: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let cutoff = now.saturating_sub(stale_after.as_millis() as i64);

        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so two processes cannot
        // both see the slot free
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale = tx.execute(
            "DELETE FROM run_lock WHERE acquired_at <= ?1 AND run_id != ?2",
            params![cutoff, run_id.as_str()],
        )?;
        if stale > 0 {
            tracing::warn!(run_id = %run_id, "Taking over stale apply lock");
        }
        let claimed = tx.execute(
            r#"
            INSERT INTO run_lock (slot, run_id, acquired_at) VALUES (1, ?1, ?2)
            ON CONFLICT(slot) DO UPDATE SET acquired_at = excluded.acquired_at
                WHERE run_lock.run_id = excluded.run_id
            "#,
            params![run_id.as_str(), now],
        )?;
        let holder: String = tx.query_row("SELECT run_id FROM run_lock WHERE slot = 1", [], |row| {
            row.get(0)
        })?;
        tx.commit()?;

        let acquired = claimed == 1 && holder == run_id.as_str();
        if !acquired {
            tracing::debug!(run_id = %run_id, holder = %holder, "Apply slot busy");
        }
        Ok(acquired)
    }

    fn release_run(&self, run_id: &RunId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM run_lock WHERE run_id = ?1",
            params![run_id.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Revision, Task};
    use crate::sync::{RunOutcome, SyncReport};
    use tempfile::TempDir;

    fn link(list: &str, doc: &str) -> SyncLink {
        let l = Task::from_fields(
            list,
            SourceSystem::ListService,
            TaskFields::new("Pay rent").with_label("home"),
            Revision::new("r1"),
        );
        let d = Task::from_fields(
            doc,
            SourceSystem::DocStore,
            TaskFields::new("Pay rent"),
            Revision::new("2024-01-15T10:00:00.000Z"),
        );
        SyncLink::between(&l, &d, Utc::now())
    }

    #[test]
    fn test_upsert_and_lookup() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let a = link("l1", "d1");
        ledger.upsert(&a).unwrap();

        let found = ledger
            .find_by_native_ref(SourceSystem::DocStore, &NativeId::new("d1"))
            .unwrap()
            .unwrap();
        assert_eq!(found.link_id, a.link_id);
        assert_eq!(found.snapshot, a.snapshot);
        assert_eq!(ledger.get(&a.link_id).unwrap().unwrap().list_service_ref.as_str(), "l1");
        assert!(ledger
            .find_by_native_ref(SourceSystem::ListService, &NativeId::new("d1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let mut a = link("l1", "d1");
        ledger.upsert(&a).unwrap();

        a.last_synced_revision_list = "r2".to_string();
        ledger.upsert(&a).unwrap();

        let all = ledger.all_links().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_synced_revision_list, "r2");
    }

    #[test]
    fn test_one_to_one_enforced() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger.upsert(&link("l1", "d1")).unwrap();

        let err = ledger.upsert(&link("l1", "d2")).unwrap_err();
        assert!(matches!(err, TaskSyncError::Validation(_)));
        let err = ledger.upsert(&link("l2", "d1")).unwrap_err();
        assert!(matches!(err, TaskSyncError::Validation(_)));
        assert_eq!(ledger.all_links().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_and_order() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let a = link("l1", "d1");
        let b = link("l2", "d2");
        let c = link("l3", "d3");
        for l in [&a, &b, &c] {
            ledger.upsert(l).unwrap();
        }
        ledger.remove(&b.link_id).unwrap();

        let ids: Vec<_> = ledger
            .all_links()
            .unwrap()
            .into_iter()
            .map(|l| l.list_service_ref.to_string())
            .collect();
        assert_eq!(ids, vec!["l1", "l3"]);
    }

    #[test]
    fn test_history_is_trimmed_and_newest_first() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let mut run_ids = Vec::new();
        for _ in 0..4 {
            let report = SyncReport::empty(RunOutcome::Completed);
            run_ids.push(report.run_id.clone());
            ledger.record_report(&report, 3).unwrap();
        }

        let history = ledger.history(10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].run_id, run_ids[3]);
        assert_eq!(history[2].run_id, run_ids[1]);
        assert_eq!(ledger.history(1).unwrap().len(), 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let a = link("l1", "d1");
        {
            let ledger = SqliteLedger::open(LedgerConfig::new(&path)).unwrap();
            ledger.upsert(&a).unwrap();
        }
        let reopened = SqliteLedger::open(LedgerConfig::new(&path)).unwrap();
        assert_eq!(reopened.all_links().unwrap(), vec![a]);
    }

    #[test]
    fn test_run_slot_shared_between_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        let cli = SqliteLedger::open(LedgerConfig::new(&path)).unwrap();
        let server = SqliteLedger::open(LedgerConfig::new(&path)).unwrap();
        let hour = Duration::from_secs(3600);

        let cli_run = RunId::generate();
        let server_run = RunId::generate();
        assert!(cli.try_acquire_run(&cli_run, hour).unwrap());
        assert!(!server.try_acquire_run(&server_run, hour).unwrap());

        // releasing someone else's claim is a no-op
        server.release_run(&server_run).unwrap();
        assert!(!server.try_acquire_run(&server_run, hour).unwrap());

        cli.release_run(&cli_run).unwrap();
        assert!(server.try_acquire_run(&server_run, hour).unwrap());
    }

    #[test]
    fn test_stale_run_slot_is_taken_over() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let crashed = RunId::generate();
        assert!(ledger
            .try_acquire_run(&crashed, Duration::from_secs(3600))
            .unwrap());

        let next = RunId::generate();
        assert!(ledger.try_acquire_run(&next, Duration::ZERO).unwrap());
        // the crashed run no longer owns it
        ledger.release_run(&crashed).unwrap();
        assert!(!ledger
            .try_acquire_run(&crashed, Duration::from_secs(3600))
            .unwrap());
    }
}
