//! Canonical task representation shared by both backends

use super::ids::NativeId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Backend that owns a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    /// Flat task list service (the "left" side)
    ListService,
    /// Hierarchical document database (the "right" side)
    DocStore,
}

impl SourceSystem {
    /// The opposite backend
    pub fn other(self) -> Self {
        match self {
            SourceSystem::ListService => SourceSystem::DocStore,
            SourceSystem::DocStore => SourceSystem::ListService,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceSystem::ListService => "list_service",
            SourceSystem::DocStore => "doc_store",
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque version marker supplied by the owning backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Timestamp string, ETag or content hash
    pub marker: String,

    /// Last modification time, when the backend reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Revision {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            modified_at: None,
        }
    }

    pub fn with_modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.modified_at = Some(at);
        self
    }
}

/// A synchronizable field of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Project,
    DueDate,
    Labels,
    Completed,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Title,
        Field::Project,
        Field::DueDate,
        Field::Labels,
        Field::Completed,
    ];
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Title => "title",
            Field::Project => "project",
            Field::DueDate => "due_date",
            Field::Labels => "labels",
            Field::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// The content of a task that is kept in sync, without identity or revision
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskFields {
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,

    #[serde(default)]
    pub labels: BTreeSet<String>,

    #[serde(default)]
    pub completed: bool,
}

impl TaskFields {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project_ref = Some(project.into());
        self
    }

    pub fn with_due_date(mut self, due: NaiveDate) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }

    /// Fields whose values differ between `self` and `other`, in declaration order
    pub fn diff(&self, other: &TaskFields) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| !self.same_value(other, *field))
            .collect()
    }

    /// Whether a single field holds the same value in both
    pub fn same_value(&self, other: &TaskFields, field: Field) -> bool {
        match field {
            Field::Title => self.title == other.title,
            Field::Project => self.project_ref == other.project_ref,
            Field::DueDate => self.due_date == other.due_date,
            Field::Labels => self.labels == other.labels,
            Field::Completed => self.completed == other.completed,
        }
    }

    /// Copy one field's value from `other`
    pub fn take_field(&mut self, other: &TaskFields, field: Field) {
        match field {
            Field::Title => self.title = other.title.clone(),
            Field::Project => self.project_ref = other.project_ref.clone(),
            Field::DueDate => self.due_date = other.due_date,
            Field::Labels => self.labels = other.labels.clone(),
            Field::Completed => self.completed = other.completed,
        }
    }
}

/// Canonical unit of work, normalized from either backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: NativeId,
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,

    #[serde(default)]
    pub labels: BTreeSet<String>,

    #[serde(default)]
    pub completed: bool,

    pub revision: Revision,
    pub source_system: SourceSystem,
}

impl Task {
    /// Build a task from its fields plus the backend identity
    pub fn from_fields(
        id: impl Into<NativeId>,
        source_system: SourceSystem,
        fields: TaskFields,
        revision: Revision,
    ) -> Self {
        Self {
            id: id.into(),
            title: fields.title,
            project_ref: fields.project_ref,
            due_date: fields.due_date,
            labels: fields.labels,
            completed: fields.completed,
            revision,
            source_system,
        }
    }

    pub fn fields(&self) -> TaskFields {
        TaskFields {
            title: self.title.clone(),
            project_ref: self.project_ref.clone(),
            due_date: self.due_date,
            labels: self.labels.clone(),
            completed: self.completed,
        }
    }

    /// A task without a project assignment
    pub fn is_orphan(&self) -> bool {
        self.project_ref
            .as_deref()
            .map(|p| p.trim().is_empty())
            .unwrap_or(true)
    }

    /// Check the invariants every synced task must hold
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.is_empty() {
            return Err("task has no native id".to_string());
        }
        if self.title.trim().is_empty() {
            return Err(format!("task {} has an empty title", self.id));
        }
        Ok(())
    }

    /// Title folded for duplicate detection: trimmed, lowercased, single-spaced
    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Fold a title for comparison
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Partial update sent to a backend
///
/// `None` leaves a field untouched. `expected_revision` turns the write into
/// an optimistic-lock write that fails with a conflict if the backend moved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_ref: Option<Option<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeSet<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_revision: Option<String>,
}

impl TaskPatch {
    /// Patch carrying the given fields' values from `fields`
    pub fn from_fields(fields: &TaskFields, which: &[Field]) -> Self {
        let mut patch = TaskPatch::default();
        for field in which {
            match field {
                Field::Title => patch.title = Some(fields.title.clone()),
                Field::Project => patch.project_ref = Some(fields.project_ref.clone()),
                Field::DueDate => patch.due_date = Some(fields.due_date),
                Field::Labels => patch.labels = Some(fields.labels.clone()),
                Field::Completed => patch.completed = Some(fields.completed),
            }
        }
        patch
    }

    /// Patch that only flips the completion flag
    pub fn complete() -> Self {
        Self {
            completed: Some(true),
            ..Default::default()
        }
    }

    pub fn with_expected_revision(mut self, revision: impl Into<String>) -> Self {
        self.expected_revision = Some(revision.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.project_ref.is_none()
            && self.due_date.is_none()
            && self.labels.is_none()
            && self.completed.is_none()
    }

    /// Apply the patch to a set of fields
    pub fn apply_to(&self, fields: &mut TaskFields) {
        if let Some(ref title) = self.title {
            fields.title = title.clone();
        }
        if let Some(ref project) = self.project_ref {
            fields.project_ref = project.clone();
        }
        if let Some(due) = self.due_date {
            fields.due_date = due;
        }
        if let Some(ref labels) = self.labels {
            fields.labels = labels.clone();
        }
        if let Some(completed) = self.completed {
            fields.completed = completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_normalized_title() {
        assert_eq!(
            normalize_title("  Revisar   propuesta de Cliente ABC "),
            "revisar propuesta de cliente abc"
        );
    }

    #[test]
    fn test_field_diff() {
        let a = TaskFields::new("Call ABC").with_due_date(date(2024, 1, 15));
        let b = TaskFields::new("Call ABC")
            .with_due_date(date(2024, 1, 16))
            .with_label("urgent");
        assert_eq!(a.diff(&b), vec![Field::DueDate, Field::Labels]);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn test_patch_apply() {
        let mut fields = TaskFields::new("Old").with_project("Work");
        let source = TaskFields::new("New").with_completed(true);
        let patch = TaskPatch::from_fields(&source, &[Field::Title, Field::Project, Field::Completed]);
        patch.apply_to(&mut fields);
        assert_eq!(fields.title, "New");
        assert_eq!(fields.project_ref, None);
        assert!(fields.completed);
        assert!(TaskPatch::default().is_empty());
        assert!(!TaskPatch::complete().is_empty());
    }

    #[test]
    fn test_validate_and_orphan() {
        let task = Task::from_fields(
            "1",
            SourceSystem::ListService,
            TaskFields::new("   "),
            Revision::new("r1"),
        );
        assert!(task.validate().is_err());
        assert!(task.is_orphan());

        let ok = Task::from_fields(
            "2",
            SourceSystem::ListService,
            TaskFields::new("Write report").with_project("Work"),
            Revision::new("r1"),
        );
        assert!(ok.validate().is_ok());
        assert!(!ok.is_orphan());
    }

    #[test]
    fn test_source_system_other() {
        assert_eq!(SourceSystem::ListService.other(), SourceSystem::DocStore);
        assert_eq!(SourceSystem::DocStore.other(), SourceSystem::ListService);
        assert_eq!(SourceSystem::DocStore.to_string(), "doc_store");
    }
}
