//! Core data model
//!
//! - **ids**: type-safe identifiers (native ids, link ids, step ids)
//! - **task**: canonical `Task`, its syncable fields, and write patches
//! - **link**: `SyncLink` ledger entries
//! - **changeset**: diff engine output

pub mod changeset;
pub mod ids;
pub mod link;
pub mod task;

pub use changeset::{
    ChangeSet, ChangeSetSummary, ConflictItem, ConflictReason, CreateItem, DeleteItem,
    InvalidItem, UpdateItem,
};
pub use ids::{ChangeSetId, LinkId, NativeId, RunId, StepId};
pub use link::SyncLink;
pub use task::{normalize_title, Field, Revision, SourceSystem, Task, TaskFields, TaskPatch};
