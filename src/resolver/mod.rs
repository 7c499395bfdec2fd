//! Conflict resolution
//!
//! Turns a detected conflict into a decision. The default policy merges
//! field by field: a field that moved on one side only (relative to the
//! snapshot stored in the ledger) takes that side's value; a field that
//! moved on both sides goes to the most recently modified task. When the
//! timestamps needed for that are absent or tied, the conflict is deferred.
//! Probable duplicates are always deferred for a human to confirm.

use crate::model::{ConflictItem, ConflictReason, Field, SourceSystem, TaskFields};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Which side supplies a field value in a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChoice {
    pub field: Field,
    pub take_from: SourceSystem,
}

/// Decision for a conflict
///
/// Left is the list service, right is the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum Resolution {
    /// List-service content wins; the doc store is overwritten
    KeepLeft,
    /// Doc-store content wins; the list service is overwritten
    KeepRight,
    /// Per-field merge; both sides may be written
    Merge(Vec<FieldChoice>),
    /// Not applied; reported and re-evaluated on the next run
    Defer(String),
}

impl Resolution {
    pub fn is_defer(&self) -> bool {
        matches!(self, Resolution::Defer(_))
    }

    /// Merged field values that both sides should hold after applying
    ///
    /// Returns `None` for `Defer`.
    pub fn merged_fields(&self, conflict: &ConflictItem) -> Option<TaskFields> {
        let list = conflict.list_task.fields();
        let doc = conflict.doc_task.fields();
        match self {
            Resolution::KeepLeft => Some(list),
            Resolution::KeepRight => Some(doc),
            Resolution::Merge(choices) => {
                let mut merged = list;
                for choice in choices {
                    if choice.take_from == SourceSystem::DocStore {
                        merged.take_field(&doc, choice.field);
                    }
                }
                Some(merged)
            }
            Resolution::Defer(_) => None,
        }
    }
}

/// Policy seam for conflict handling
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &ConflictItem) -> Resolution;
}

/// Field-level "most recently modified wins" policy
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl DefaultResolver {
    pub fn new() -> Self {
        Self
    }

    /// Side whose task was modified last, if timestamps allow telling
    fn most_recent(conflict: &ConflictItem) -> Option<SourceSystem> {
        let list_at = conflict.list_task.revision.modified_at?;
        let doc_at = conflict.doc_task.revision.modified_at?;
        match list_at.cmp(&doc_at) {
            Ordering::Greater => Some(SourceSystem::ListService),
            Ordering::Less => Some(SourceSystem::DocStore),
            Ordering::Equal => None,
        }
    }

    fn choose(conflict: &ConflictItem, field: Field) -> Option<SourceSystem> {
        let list = conflict.list_task.fields();
        let doc = conflict.doc_task.fields();

        if let Some(base) = conflict.link.as_ref().and_then(|l| l.snapshot.as_ref()) {
            let list_moved = !list.same_value(base, field);
            let doc_moved = !doc.same_value(base, field);
            match (list_moved, doc_moved) {
                (true, false) => return Some(SourceSystem::ListService),
                (false, true) => return Some(SourceSystem::DocStore),
                _ => {}
            }
        }

        Self::most_recent(conflict)
    }
}

impl ConflictResolver for DefaultResolver {
    fn resolve(&self, conflict: &ConflictItem) -> Resolution {
        if conflict.reason == ConflictReason::PotentialDuplicate {
            return Resolution::Defer(
                "possible duplicate; confirm manually before linking".to_string(),
            );
        }

        let mut choices = Vec::with_capacity(conflict.differing_fields.len());
        for field in &conflict.differing_fields {
            match Self::choose(conflict, *field) {
                Some(side) => choices.push(FieldChoice {
                    field: *field,
                    take_from: side,
                }),
                None => {
                    return Resolution::Defer(format!(
                        "field '{}' changed on both sides and modification times cannot decide",
                        field
                    ));
                }
            }
        }

        if choices
            .iter()
            .all(|c| c.take_from == SourceSystem::ListService)
        {
            Resolution::KeepLeft
        } else if choices.iter().all(|c| c.take_from == SourceSystem::DocStore) {
            Resolution::KeepRight
        } else {
            Resolution::Merge(choices)
        }
    }
}

/// Resolver that defers everything; used when the caller wants every
/// conflict confirmed by hand
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualResolver;

impl ConflictResolver for ManualResolver {
    fn resolve(&self, _conflict: &ConflictItem) -> Resolution {
        Resolution::Defer("manual resolution requested".to_string())
    }
}
