//! Diff engine
//!
//! Pure computation of the change set that reconciles both backends, given
//! their current snapshots and the ledger.
//!
//! # Algorithm
//!
//! 1. Validate every fetched task; invalid ones go to `invalid` and are
//!    otherwise ignored (their links are left alone).
//! 2. Partition valid tasks into linked and unlinked.
//! 3. Unlinked tasks pair up as probable duplicates when their normalized
//!    title and due date match; the rest become creates on the other side.
//! 4. Linked pairs are classified by comparing current revisions against
//!    the revisions recorded at the last sync.
//! 5. Links with a missing side become deletes targeting the survivor.
//!
//! Output order follows the input fetch order. The engine reads no clock
//! and draws no randomness, so identical inputs give identical output.

use crate::model::{
    ChangeSet, ConflictItem, ConflictReason, CreateItem, DeleteItem, InvalidItem, NativeId,
    SourceSystem, StepId, SyncLink, Task, UpdateItem,
};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

/// Knobs for a diff run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Treat linked tasks missing from a fetch as deleted.
    ///
    /// Must be off when the fetch was filtered, otherwise every task outside
    /// the filter would look removed.
    pub detect_deletions: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            detect_deletions: true,
        }
    }
}

/// Classification of a single linked pair
#[derive(Debug, Clone, PartialEq)]
pub enum PairDiff {
    /// Revisions unchanged on both sides
    Unchanged,
    /// Revisions moved but both sides hold the same content
    Refresh(SyncLink),
    Update(UpdateItem),
    Conflict(ConflictItem),
}

/// Compute the change set with default options
pub fn compute_change_set(list_tasks: &[Task], doc_tasks: &[Task], links: &[SyncLink]) -> ChangeSet {
    compute_change_set_with(list_tasks, doc_tasks, links, DiffOptions::default())
}

/// Compute the change set that reconciles `list_tasks` and `doc_tasks`
pub fn compute_change_set_with(
    list_tasks: &[Task],
    doc_tasks: &[Task],
    links: &[SyncLink],
    options: DiffOptions,
) -> ChangeSet {
    let mut change_set = ChangeSet::empty();

    // Validation
    let mut invalid_ids: HashSet<(SourceSystem, NativeId)> = HashSet::new();
    for task in list_tasks.iter().chain(doc_tasks.iter()) {
        if let Err(reason) = task.validate() {
            invalid_ids.insert((task.source_system, task.id.clone()));
            change_set.invalid.push(InvalidItem {
                step_id: step_id_for_invalid(task),
                system: task.source_system,
                native_id: task.id.clone(),
                title: task.title.clone(),
                reason,
            });
        }
    }
    let is_valid = |task: &Task| !invalid_ids.contains(&(task.source_system, task.id.clone()));

    let link_by_list: HashMap<&NativeId, &SyncLink> =
        links.iter().map(|l| (&l.list_service_ref, l)).collect();
    let link_by_doc: HashMap<&NativeId, &SyncLink> =
        links.iter().map(|l| (&l.doc_store_ref, l)).collect();

    let list_present: HashSet<&NativeId> = list_tasks.iter().map(|t| &t.id).collect();
    let doc_by_id: HashMap<&NativeId, &Task> = doc_tasks.iter().map(|t| (&t.id, t)).collect();

    let unlinked_list: Vec<&Task> = list_tasks
        .iter()
        .filter(|t| is_valid(*t) && !link_by_list.contains_key(&t.id))
        .collect();
    let unlinked_doc: Vec<&Task> = doc_tasks
        .iter()
        .filter(|t| is_valid(*t) && !link_by_doc.contains_key(&t.id))
        .collect();

    // Probable duplicates: first unmatched doc task with the same key wins
    let mut doc_by_key: HashMap<(String, Option<NaiveDate>), Vec<usize>> = HashMap::new();
    for (idx, task) in unlinked_doc.iter().enumerate() {
        doc_by_key.entry(duplicate_key(task)).or_default().push(idx);
    }
    let mut claimed_doc: HashSet<usize> = HashSet::new();
    let mut claimed_list: HashSet<usize> = HashSet::new();
    for (list_idx, list_task) in unlinked_list.iter().enumerate() {
        let Some(candidates) = doc_by_key.get(&duplicate_key(list_task)) else {
            continue;
        };
        if let Some(&doc_idx) = candidates.iter().find(|i| !claimed_doc.contains(*i)) {
            claimed_doc.insert(doc_idx);
            claimed_list.insert(list_idx);
            let doc_task = unlinked_doc[doc_idx];
            change_set.conflicts.push(ConflictItem {
                step_id: StepId::new(format!("duplicate:{}:{}", list_task.id, doc_task.id)),
                reason: ConflictReason::PotentialDuplicate,
                list_task: (*list_task).clone(),
                doc_task: doc_task.clone(),
                link: None,
                differing_fields: list_task.fields().diff(&doc_task.fields()),
                proposed: None,
            });
        }
    }

    for (idx, task) in unlinked_list.iter().enumerate() {
        if !claimed_list.contains(&idx) {
            change_set.creates.push(create_item(task));
        }
    }
    for (idx, task) in unlinked_doc.iter().enumerate() {
        if !claimed_doc.contains(&idx) {
            change_set.creates.push(create_item(task));
        }
    }

    // Linked pairs, in list fetch order
    let mut handled_links: HashSet<&str> = HashSet::new();
    for list_task in list_tasks {
        let Some(link) = link_by_list.get(&list_task.id) else {
            continue;
        };
        handled_links.insert(link.link_id.as_str());
        if !is_valid(list_task) {
            continue;
        }
        match doc_by_id.get(&link.doc_store_ref) {
            Some(&doc_task) => {
                if !is_valid(doc_task) {
                    continue;
                }
                match diff_pair(list_task, doc_task, link) {
                    PairDiff::Unchanged => {}
                    PairDiff::Refresh(refreshed) => change_set.ledger_refreshes.push(refreshed),
                    PairDiff::Update(update) => change_set.updates.push(update),
                    PairDiff::Conflict(conflict) => change_set.conflicts.push(conflict),
                }
            }
            None if options.detect_deletions => {
                change_set.deletes.push(delete_item(
                    link,
                    SourceSystem::DocStore,
                    Some(list_task),
                ));
            }
            None => {}
        }
    }

    // Doc tasks whose list counterpart vanished
    for doc_task in doc_tasks {
        let Some(link) = link_by_doc.get(&doc_task.id) else {
            continue;
        };
        if handled_links.contains(link.link_id.as_str()) {
            continue;
        }
        handled_links.insert(link.link_id.as_str());
        if !is_valid(doc_task) || list_present.contains(&link.list_service_ref) {
            continue;
        }
        if options.detect_deletions {
            change_set.deletes.push(delete_item(
                link,
                SourceSystem::ListService,
                Some(doc_task),
            ));
        }
    }

    // Links with both sides gone
    if options.detect_deletions {
        for link in links {
            if handled_links.contains(link.link_id.as_str()) {
                continue;
            }
            change_set
                .deletes
                .push(delete_item(link, SourceSystem::ListService, None));
        }
    }

    tracing::debug!(
        creates = change_set.creates.len(),
        updates = change_set.updates.len(),
        conflicts = change_set.conflicts.len(),
        deletes = change_set.deletes.len(),
        invalid = change_set.invalid.len(),
        "Computed change set"
    );

    change_set
}

/// Classify one linked pair against its ledger entry
pub fn diff_pair(list_task: &Task, doc_task: &Task, link: &SyncLink) -> PairDiff {
    let list_changed = link.changed_since_sync(list_task);
    let doc_changed = link.changed_since_sync(doc_task);

    if !list_changed && !doc_changed {
        return PairDiff::Unchanged;
    }

    let differing = list_task.fields().diff(&doc_task.fields());
    if differing.is_empty() {
        let mut refreshed = link.clone();
        refreshed.last_synced_revision_list = list_task.revision.marker.clone();
        refreshed.last_synced_revision_doc = doc_task.revision.marker.clone();
        refreshed.snapshot = Some(list_task.fields());
        return PairDiff::Refresh(refreshed);
    }

    match (list_changed, doc_changed) {
        (true, false) => PairDiff::Update(UpdateItem {
            step_id: StepId::new(format!("update:{}", link.link_id)),
            link: link.clone(),
            source: list_task.clone(),
            counterpart: doc_task.clone(),
            target: SourceSystem::DocStore,
            changed_fields: differing,
        }),
        (false, true) => PairDiff::Update(UpdateItem {
            step_id: StepId::new(format!("update:{}", link.link_id)),
            link: link.clone(),
            source: doc_task.clone(),
            counterpart: list_task.clone(),
            target: SourceSystem::ListService,
            changed_fields: differing,
        }),
        _ => PairDiff::Conflict(ConflictItem {
            step_id: StepId::new(format!("conflict:{}", link.link_id)),
            reason: ConflictReason::BothModified,
            list_task: list_task.clone(),
            doc_task: doc_task.clone(),
            link: Some(link.clone()),
            differing_fields: differing,
            proposed: None,
        }),
    }
}

fn duplicate_key(task: &Task) -> (String, Option<NaiveDate>) {
    (task.normalized_title(), task.due_date)
}

fn create_item(task: &Task) -> CreateItem {
    CreateItem {
        step_id: StepId::new(format!("create:{}:{}", task.source_system, task.id)),
        task: task.clone(),
        target: task.source_system.other(),
    }
}

fn delete_item(link: &SyncLink, removed_from: SourceSystem, counterpart: Option<&Task>) -> DeleteItem {
    DeleteItem {
        step_id: StepId::new(format!("delete:{}", link.link_id)),
        link: link.clone(),
        removed_from,
        counterpart: counterpart.cloned(),
    }
}

fn step_id_for_invalid(task: &Task) -> StepId {
    StepId::new(format!("invalid:{}:{}", task.source_system, task.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, Revision, TaskFields};
    use chrono::{TimeZone, Utc};

    fn list(id: &str, title: &str, rev: &str) -> Task {
        Task::from_fields(id, SourceSystem::ListService, TaskFields::new(title), Revision::new(rev))
    }

    fn doc(id: &str, title: &str, rev: &str) -> Task {
        Task::from_fields(id, SourceSystem::DocStore, TaskFields::new(title), Revision::new(rev))
    }

    fn link(list_task: &Task, doc_task: &Task) -> SyncLink {
        let mut link = SyncLink::between(
            list_task,
            doc_task,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        link.link_id = format!("link-{}-{}", list_task.id, doc_task.id).into();
        link
    }

    #[test]
    fn test_unchanged_pair_is_noop() {
        let l = list("l1", "Buy milk", "r1");
        let d = doc("d1", "Buy milk", "e1");
        let cs = compute_change_set(&[l.clone()], &[d.clone()], &[link(&l, &d)]);
        assert!(cs.is_empty());
        assert!(cs.ledger_refreshes.is_empty());
    }

    #[test]
    fn test_unlinked_tasks_create_on_other_side() {
        let cs = compute_change_set(
            &[list("l1", "Buy milk", "r1")],
            &[doc("d1", "Write report", "e1")],
            &[],
        );
        assert_eq!(cs.creates.len(), 2);
        assert_eq!(cs.creates[0].target, SourceSystem::DocStore);
        assert_eq!(cs.creates[1].target, SourceSystem::ListService);
        assert_eq!(cs.creates[0].step_id.as_str(), "create:list_service:l1");
    }

    #[test]
    fn test_only_list_changed_updates_doc() {
        let l = list("l1", "Buy milk", "r1");
        let d = doc("d1", "Buy milk", "e1");
        let ledger = vec![link(&l, &d)];
        let edited = list("l1", "Buy oat milk", "r2");

        let cs = compute_change_set(&[edited], &[d], &ledger);
        assert_eq!(cs.updates.len(), 1);
        assert_eq!(cs.updates[0].target, SourceSystem::DocStore);
        assert_eq!(cs.updates[0].changed_fields, vec![Field::Title]);
        assert!(cs.conflicts.is_empty());
    }

    #[test]
    fn test_only_doc_changed_updates_list() {
        let l = list("l1", "Buy milk", "r1");
        let d = doc("d1", "Buy milk", "e1");
        let ledger = vec![link(&l, &d)];
        let mut edited = doc("d1", "Buy milk", "e2");
        edited.completed = true;

        let cs = compute_change_set(&[l], &[edited], &ledger);
        assert_eq!(cs.updates.len(), 1);
        assert_eq!(cs.updates[0].target, SourceSystem::ListService);
        assert_eq!(cs.updates[0].changed_fields, vec![Field::Completed]);
    }

    #[test]
    fn test_both_changed_is_conflict_never_update() {
        let l = list("l1", "Buy milk", "r1");
        let d = doc("d1", "Buy milk", "e1");
        let ledger = vec![link(&l, &d)];

        let cs = compute_change_set(
            &[list("l1", "Buy oat milk", "r2")],
            &[doc("d1", "Buy soy milk", "e2")],
            &ledger,
        );
        assert!(cs.updates.is_empty());
        assert_eq!(cs.conflicts.len(), 1);
        assert_eq!(cs.conflicts[0].reason, ConflictReason::BothModified);
        assert_eq!(cs.conflicts[0].differing_fields, vec![Field::Title]);
    }

    #[test]
    fn test_both_changed_to_same_content_refreshes() {
        let l = list("l1", "Buy milk", "r1");
        let d = doc("d1", "Buy milk", "e1");
        let ledger = vec![link(&l, &d)];

        let cs = compute_change_set(
            &[list("l1", "Buy bread", "r2")],
            &[doc("d1", "Buy bread", "e2")],
            &ledger,
        );
        assert!(cs.is_empty());
        assert_eq!(cs.ledger_refreshes.len(), 1);
        assert_eq!(cs.ledger_refreshes[0].last_synced_revision_list, "r2");
        assert_eq!(cs.ledger_refreshes[0].last_synced_revision_doc, "e2");
    }

    #[test]
    fn test_potential_duplicate_is_conflict() {
        let due = NaiveDate::from_ymd_opt(2024, 1, 20).unwrap();
        let mut l = list("l1", "Revisar propuesta de cliente ABC", "r1");
        l.due_date = Some(due);
        let mut d = doc("d1", "revisar  propuesta de Cliente ABC", "e1");
        d.due_date = Some(due);

        let cs = compute_change_set(&[l], &[d], &[]);
        assert!(cs.creates.is_empty());
        assert_eq!(cs.conflicts.len(), 1);
        assert_eq!(cs.conflicts[0].reason, ConflictReason::PotentialDuplicate);
        assert!(cs.conflicts[0].link.is_none());
    }

    #[test]
    fn test_same_title_different_due_is_not_duplicate() {
        let mut l = list("l1", "Pay rent", "r1");
        l.due_date = NaiveDate::from_ymd_opt(2024, 1, 1);
        let mut d = doc("d1", "Pay rent", "e1");
        d.due_date = NaiveDate::from_ymd_opt(2024, 2, 1);

        let cs = compute_change_set(&[l], &[d], &[]);
        assert_eq!(cs.creates.len(), 2);
        assert!(cs.conflicts.is_empty());
    }

    #[test]
    fn test_removed_side_yields_delete() {
        let l = list("l1", "Buy milk", "r1");
        let d = doc("d1", "Buy milk", "e1");
        let ledger = vec![link(&l, &d)];

        let cs = compute_change_set(&[], &[d.clone()], &ledger);
        assert_eq!(cs.deletes.len(), 1);
        assert_eq!(cs.deletes[0].removed_from, SourceSystem::ListService);
        assert_eq!(cs.deletes[0].target(), Some(SourceSystem::DocStore));

        let cs = compute_change_set(&[l], &[], &ledger);
        assert_eq!(cs.deletes[0].removed_from, SourceSystem::DocStore);
        assert_eq!(cs.deletes[0].target(), Some(SourceSystem::ListService));

        let cs = compute_change_set(&[], &[], &ledger);
        assert_eq!(cs.deletes.len(), 1);
        assert_eq!(cs.deletes[0].target(), None);
    }

    #[test]
    fn test_deletions_disabled_for_partial_fetch() {
        let l = list("l1", "Buy milk", "r1");
        let d = doc("d1", "Buy milk", "e1");
        let ledger = vec![link(&l, &d)];

        let cs = compute_change_set_with(
            &[],
            &[d],
            &ledger,
            DiffOptions {
                detect_deletions: false,
            },
        );
        assert!(cs.deletes.is_empty());
    }

    #[test]
    fn test_invalid_task_is_reported_and_not_deleted() {
        let l = list("l1", "Buy milk", "r1");
        let d = doc("d1", "Buy milk", "e1");
        let ledger = vec![link(&l, &d)];
        let broken = doc("d1", "  ", "e2");

        let cs = compute_change_set(&[l], &[broken, doc("d2", "", "e1")], &ledger);
        assert_eq!(cs.invalid.len(), 2);
        assert!(cs.deletes.is_empty());
        assert!(cs.updates.is_empty());
        assert!(cs.creates.is_empty());
    }

    #[test]
    fn test_output_follows_fetch_order_and_is_deterministic() {
        let lists: Vec<Task> = (0..5).map(|i| list(&format!("l{}", i), &format!("T{}", i), "r1")).collect();
        let first = compute_change_set(&lists, &[], &[]);
        let second = compute_change_set(&lists, &[], &[]);
        assert_eq!(first, second);
        let ids: Vec<&str> = first.creates.iter().map(|c| c.task.id.as_str()).collect();
        assert_eq!(ids, vec!["l0", "l1", "l2", "l3", "l4"]);
    }
}
