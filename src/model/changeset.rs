//! Output of the diff engine for one run

use super::ids::{ChangeSetId, NativeId, StepId};
use super::link::SyncLink;
use super::task::{Field, SourceSystem, Task};
use crate::resolver::Resolution;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Why a pair was routed to conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Both sides of a linked pair moved since the last sync
    BothModified,
    /// Two unlinked tasks look like the same real-world task
    PotentialDuplicate,
}

/// Task present on one side only, to be created on the other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateItem {
    pub step_id: StepId,
    pub task: Task,
    pub target: SourceSystem,
}

/// Linked pair where exactly one side changed since the last sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateItem {
    pub step_id: StepId,
    pub link: SyncLink,
    /// The side that changed
    pub source: Task,
    /// Current state of the side that will be written
    pub counterpart: Task,
    pub target: SourceSystem,
    pub changed_fields: Vec<Field>,
}

/// Pair that cannot be reconciled without a policy decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictItem {
    pub step_id: StepId,
    pub reason: ConflictReason,
    pub list_task: Task,
    pub doc_task: Task,

    /// Ledger entry for `BothModified`, absent for duplicates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<SyncLink>,

    pub differing_fields: Vec<Field>,

    /// Resolution proposed by the resolver during preview
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed: Option<Resolution>,
}

impl ConflictItem {
    /// The task on one side of the conflict
    pub fn task(&self, system: SourceSystem) -> &Task {
        match system {
            SourceSystem::ListService => &self.list_task,
            SourceSystem::DocStore => &self.doc_task,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.proposed, Some(Resolution::Defer(_)))
    }
}

/// Linked pair where one side's task was removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteItem {
    pub step_id: StepId,
    pub link: SyncLink,
    pub removed_from: SourceSystem,

    /// Surviving task on the other side, if any. `None` when both sides
    /// disappeared and only the ledger entry is left to clean up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<Task>,
}

impl DeleteItem {
    /// Side that will be written, if any
    pub fn target(&self) -> Option<SourceSystem> {
        self.counterpart.as_ref().map(|t| t.source_system)
    }
}

/// Task rejected by validation; never written anywhere
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidItem {
    pub step_id: StepId,
    pub system: SourceSystem,
    pub native_id: NativeId,
    pub title: String,
    pub reason: String,
}

/// Set of changes required to reconcile both sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub creates: Vec<CreateItem>,
    pub updates: Vec<UpdateItem>,
    pub conflicts: Vec<ConflictItem>,
    pub deletes: Vec<DeleteItem>,
    pub invalid: Vec<InvalidItem>,

    /// Links whose revisions moved while content stayed equal on both sides.
    /// Applying only refreshes the ledger; no step is emitted for them.
    #[serde(default)]
    pub ledger_refreshes: Vec<SyncLink>,
}

/// Counts shown on the preview screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetSummary {
    pub total_tasks: usize,
    pub creates: usize,
    pub updates: usize,
    pub conflicts: usize,
    pub deletes: usize,
    pub invalid: usize,
    pub projects: Vec<String>,
}

impl ChangeSet {
    pub fn empty() -> Self {
        Self {
            id: ChangeSetId::pending(),
            creates: Vec::new(),
            updates: Vec::new(),
            conflicts: Vec::new(),
            deletes: Vec::new(),
            invalid: Vec::new(),
            ledger_refreshes: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: ChangeSetId) -> Self {
        self.id = id;
        self
    }

    /// No effective change: nothing to create, update, resolve or delete
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.conflicts.is_empty()
            && self.deletes.is_empty()
    }

    /// Number of steps an apply of this change set will report
    pub fn item_count(&self) -> usize {
        self.creates.len()
            + self.updates.len()
            + self.conflicts.len()
            + self.deletes.len()
            + self.invalid.len()
    }

    /// Step ids selected by default on the preview screen: creates and updates
    pub fn default_selection(&self) -> BTreeSet<StepId> {
        self.creates
            .iter()
            .map(|c| c.step_id.clone())
            .chain(self.updates.iter().map(|u| u.step_id.clone()))
            .collect()
    }

    pub fn summary(&self) -> ChangeSetSummary {
        let mut projects = BTreeSet::new();
        let mut note = |task: &Task| {
            if let Some(ref p) = task.project_ref {
                if !p.trim().is_empty() {
                    projects.insert(p.clone());
                }
            }
        };
        for c in &self.creates {
            note(&c.task);
        }
        for u in &self.updates {
            note(&u.source);
        }
        for c in &self.conflicts {
            note(&c.list_task);
            note(&c.doc_task);
        }
        for d in &self.deletes {
            if let Some(ref t) = d.counterpart {
                note(t);
            }
        }

        ChangeSetSummary {
            total_tasks: self.item_count(),
            creates: self.creates.len(),
            updates: self.updates.len(),
            conflicts: self.conflicts.len(),
            deletes: self.deletes.len(),
            invalid: self.invalid.len(),
            projects: projects.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::{Revision, TaskFields};

    #[test]
    fn test_summary_collects_projects() {
        let mut cs = ChangeSet::empty();
        for (i, project) in ["Work", "Home", "Work"].iter().enumerate() {
            cs.creates.push(CreateItem {
                step_id: StepId::new(format!("create:list_service:{}", i)),
                task: Task::from_fields(
                    format!("{}", i),
                    SourceSystem::ListService,
                    TaskFields::new("t").with_project(*project),
                    Revision::new("r1"),
                ),
                target: SourceSystem::DocStore,
            });
        }

        let summary = cs.summary();
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.creates, 3);
        assert_eq!(summary.projects, vec!["Home".to_string(), "Work".to_string()]);
        assert_eq!(cs.default_selection().len(), 3);
        assert!(!cs.is_empty());
        assert!(ChangeSet::empty().is_empty());
    }
}
