//! Backend connectors
//!
//! Adapters that normalize each backend's native task representation into
//! the common [`Task`] shape.
//!
//! # Connectors
//!
//! - **list_service**: Todoist-style REST API (flat task list)
//! - **doc_store**: Notion-style database API (pages with properties)
//! - **memory**: in-process backend with fault injection, for tests and demos
//!
//! # Call path
//!
//! The orchestrator never calls an adapter directly. Every call goes through
//! [`throttle::Throttled`] (per-backend concurrency cap and request spacing)
//! and is wrapped in [`retry::with_retry`] (exponential backoff on transient
//! failures).

pub mod doc_store;
pub mod list_service;
pub mod memory;
pub mod retry;
pub mod throttle;

pub use doc_store::DocStoreAdapter;
pub use list_service::ListServiceAdapter;
pub use memory::{FaultKind, FaultOp, MemoryConnector};
pub use retry::{with_retry, RetryConfig, RetryDecision, RetryableError};
pub use throttle::Throttled;

use crate::model::{NativeId, SourceSystem, Task, TaskFields, TaskPatch};
use crate::{Result, TaskSyncError};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

/// Restricts which tasks a fetch returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Only tasks in this project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Include completed tasks (completion syncs both ways, so on by default)
    #[serde(default = "default_include_completed")]
    pub include_completed: bool,

    /// Only tasks carrying this label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

fn default_include_completed() -> bool {
    true
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            project: None,
            include_completed: true,
            label: None,
        }
    }
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            ..Default::default()
        }
    }

    /// A filter that returns the whole backend
    ///
    /// Deletion detection is only sound against an unrestricted fetch: a task
    /// missing from a filtered fetch may simply be out of scope.
    pub fn is_unrestricted(&self) -> bool {
        self.project.is_none() && self.label.is_none() && self.include_completed
    }

    /// Client-side check, for backends whose API cannot filter natively
    pub fn matches(&self, task: &Task) -> bool {
        if !self.include_completed && task.completed {
            return false;
        }
        if let Some(ref project) = self.project {
            if task.project_ref.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        if let Some(ref label) = self.label {
            if !task.labels.contains(label) {
                return false;
            }
        }
        true
    }
}

/// Capability set every backend adapter implements
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend this connector talks to
    fn system(&self) -> SourceSystem;

    /// Fetch every task matching the filter, in backend order
    async fn fetch_all(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Fetch a single task, `None` if it no longer exists
    async fn fetch_one(&self, id: &NativeId) -> Result<Option<Task>>;

    /// Create a task; returns it with the backend-assigned id and revision
    async fn create(&self, fields: &TaskFields) -> Result<Task>;

    /// Apply a patch. Fails with `Conflict` when `patch.expected_revision`
    /// no longer matches the backend.
    async fn update(&self, id: &NativeId, patch: &TaskPatch) -> Result<Task>;

    /// Remove a task
    async fn delete(&self, id: &NativeId) -> Result<()>;
}

/// Read an auth token from the named environment variable
///
/// Called lazily on the first request so a missing token surfaces as an
/// `Auth` error during a run rather than at startup.
pub(crate) fn token_from_env(env_var: &str) -> Result<String> {
    let name = env_var.trim_start_matches('$');
    match std::env::var(name) {
        Ok(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(TaskSyncError::Auth(format!(
            "no token found in environment variable {}",
            name
        ))),
    }
}

/// Map a non-success HTTP response onto the error taxonomy
pub(crate) async fn status_error(
    system: SourceSystem,
    native_id: Option<&NativeId>,
    response: Response,
) -> TaskSyncError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);
    let body = response.text().await.unwrap_or_default();
    classify_status(system, native_id, status, retry_after, &body)
}

pub(crate) fn classify_status(
    system: SourceSystem,
    native_id: Option<&NativeId>,
    status: StatusCode,
    retry_after: u64,
    body: &str,
) -> TaskSyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TaskSyncError::Auth(format!("{} rejected credentials: HTTP {}", system, status))
        }
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => TaskSyncError::conflict(
            native_id.map(|id| id.as_str()).unwrap_or_default(),
            format!("{} reported a revision mismatch: {}", system, body),
        ),
        StatusCode::TOO_MANY_REQUESTS => TaskSyncError::RateLimited(retry_after),
        StatusCode::NOT_FOUND => TaskSyncError::NotFound(format!(
            "{} {}",
            system,
            native_id.map(|id| id.as_str()).unwrap_or("resource")
        )),
        s if s.is_server_error() => {
            TaskSyncError::Transient(format!("{} API error: HTTP {}: {}", system, s, body))
        }
        s => TaskSyncError::Validation(format!("{} API error: HTTP {}: {}", system, s, body)),
    }
}

/// Turn a transport-level reqwest failure into a retryable error
pub(crate) fn transport_error(system: SourceSystem, err: reqwest::Error) -> TaskSyncError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        TaskSyncError::Transient(format!("{} unreachable: {}", system, err))
    } else {
        TaskSyncError::Http(err)
    }
}
