//! Ledger entries binding a list-service task to a doc-store task

use super::ids::{LinkId, NativeId};
use super::task::{SourceSystem, Task, TaskFields};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Binding of one list-service task to one doc-store task
///
/// The mapping is 1:1: the ledger holds at most one link per native id on
/// each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLink {
    pub link_id: LinkId,
    pub list_service_ref: NativeId,
    pub doc_store_ref: NativeId,
    pub last_synced_revision_list: String,
    pub last_synced_revision_doc: String,
    pub last_synced_at: DateTime<Utc>,

    /// Field values both sides agreed on at the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<TaskFields>,
}

impl SyncLink {
    /// Link two tasks that now hold the same content
    pub fn between(list_task: &Task, doc_task: &Task, synced_at: DateTime<Utc>) -> Self {
        Self {
            link_id: LinkId::generate(),
            list_service_ref: list_task.id.clone(),
            doc_store_ref: doc_task.id.clone(),
            last_synced_revision_list: list_task.revision.marker.clone(),
            last_synced_revision_doc: doc_task.revision.marker.clone(),
            last_synced_at: synced_at,
            snapshot: Some(list_task.fields()),
        }
    }

    /// Native id on the given side
    pub fn native_ref(&self, system: SourceSystem) -> &NativeId {
        match system {
            SourceSystem::ListService => &self.list_service_ref,
            SourceSystem::DocStore => &self.doc_store_ref,
        }
    }

    /// Revision observed on the given side at the last sync
    pub fn last_revision(&self, system: SourceSystem) -> &str {
        match system {
            SourceSystem::ListService => &self.last_synced_revision_list,
            SourceSystem::DocStore => &self.last_synced_revision_doc,
        }
    }

    /// Whether the given task moved since the last sync
    pub fn changed_since_sync(&self, task: &Task) -> bool {
        task.revision.marker != self.last_revision(task.source_system)
    }

    /// Record a successful sync of both sides
    pub fn mark_synced(
        &mut self,
        list_revision: impl Into<String>,
        doc_revision: impl Into<String>,
        snapshot: TaskFields,
        synced_at: DateTime<Utc>,
    ) {
        self.last_synced_revision_list = list_revision.into();
        self.last_synced_revision_doc = doc_revision.into();
        self.snapshot = Some(snapshot);
        self.last_synced_at = synced_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::Revision;

    fn task(id: &str, system: SourceSystem, rev: &str) -> Task {
        Task::from_fields(id, system, TaskFields::new("Pay rent"), Revision::new(rev))
    }

    #[test]
    fn test_link_between() {
        let list = task("l-1", SourceSystem::ListService, "r1");
        let doc = task("d-1", SourceSystem::DocStore, "2024-01-15T10:00:00Z");
        let link = SyncLink::between(&list, &doc, Utc::now());

        assert_eq!(link.native_ref(SourceSystem::ListService).as_str(), "l-1");
        assert_eq!(link.native_ref(SourceSystem::DocStore).as_str(), "d-1");
        assert_eq!(link.last_revision(SourceSystem::DocStore), "2024-01-15T10:00:00Z");
        assert!(!link.changed_since_sync(&list));
        assert!(link.changed_since_sync(&task("l-1", SourceSystem::ListService, "r2")));
        assert_eq!(link.snapshot.as_ref().map(|s| s.title.as_str()), Some("Pay rent"));
    }
}
