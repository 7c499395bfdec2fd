//! List service adapter
//!
//! Talks to a Todoist-style REST API. Tasks reference projects by id; the
//! adapter resolves ids to project names so both backends share the same
//! project vocabulary. Tasks sitting in the built-in inbox project are
//! reported without a project (orphans).

use super::{status_error, token_from_env, transport_error, Connector, TaskFilter};
use crate::config::ListServiceConfig;
use crate::model::{NativeId, Revision, SourceSystem, Task, TaskFields, TaskPatch};
use crate::{Result, TaskSyncError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SYSTEM: SourceSystem = SourceSystem::ListService;

/// Per-request timeout for list operations
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout for single task fetches
const GET_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request timeout for writes
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Task as returned by the list service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTask {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub due: Option<ListDue>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDue {
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListProject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_inbox_project: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct CompletedTasksResponse {
    #[serde(default)]
    items: Vec<ListTask>,
}

/// Body for create and update requests
#[derive(Debug, Clone, Default, Serialize)]
struct ListTaskWrite {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    /// `Some("no date")` clears the due date
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<Vec<String>>,
}

impl ListTaskWrite {
    fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.project_id.is_none()
            && self.due_date.is_none()
            && self.due_string.is_none()
            && self.labels.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
struct ProjectCreate {
    name: String,
}

#[derive(Debug, Default)]
struct ProjectCache {
    names: HashMap<String, String>,
    inbox_id: Option<String>,
}

impl ProjectCache {
    fn from_projects(projects: Vec<ListProject>) -> Self {
        let mut cache = Self::default();
        for project in projects {
            if project.is_inbox_project {
                cache.inbox_id = Some(project.id.clone());
            }
            cache.names.insert(project.id, project.name);
        }
        cache
    }

    fn id_for(&self, name: &str) -> Option<String> {
        self.names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| id.clone())
    }
}

/// Client for the list service
pub struct ListServiceAdapter {
    client: Client,
    config: ListServiceConfig,
    base_url: String,
    auth_token: Option<String>,
    projects: Mutex<Option<ProjectCache>>,
}

impl ListServiceAdapter {
    /// Create a new adapter
    ///
    /// The token is not read here; the first request reads it from the
    /// configured environment variable.
    pub fn new(config: ListServiceConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let base_url = config.api_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            config,
            base_url,
            auth_token: None,
            projects: Mutex::new(None),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn token(&self) -> Result<String> {
        match self.auth_token {
            Some(ref token) => Ok(token.clone()),
            None => token_from_env(&self.config.token_env),
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        timeout: Duration,
        native_id: Option<&NativeId>,
    ) -> Result<Response> {
        let response = request
            .bearer_auth(self.token()?)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(SYSTEM, e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(SYSTEM, native_id, response).await)
        }
    }

    /// Load the project list once per adapter
    async fn ensure_projects(&self) -> Result<()> {
        let mut cache = self.projects.lock().await;
        if cache.is_some() {
            return Ok(());
        }

        let url = format!("{}/projects", self.base_url);
        let response = self.send(self.client.get(&url), LIST_TIMEOUT, None).await?;
        let projects: Vec<ListProject> = response.json().await?;
        debug!(count = projects.len(), "Loaded list service projects");
        *cache = Some(ProjectCache::from_projects(projects));
        Ok(())
    }

    async fn project_name(&self, project_id: Option<&str>) -> Option<String> {
        let id = project_id?;
        let cache = self.projects.lock().await;
        let cache = cache.as_ref()?;
        if cache.inbox_id.as_deref() == Some(id) {
            return None;
        }
        cache.names.get(id).cloned()
    }

    /// Resolve a project name to an id, creating the project when missing
    async fn project_id(&self, name: Option<&str>) -> Result<Option<String>> {
        self.ensure_projects().await?;

        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n,
            _ => {
                let cache = self.projects.lock().await;
                return Ok(cache.as_ref().and_then(|c| c.inbox_id.clone()));
            }
        };

        if let Some(id) = self
            .projects
            .lock()
            .await
            .as_ref()
            .and_then(|c| c.id_for(name))
        {
            return Ok(Some(id));
        }

        info!(project = %name, "Creating list service project");
        let url = format!("{}/projects", self.base_url);
        let body = ProjectCreate {
            name: name.to_string(),
        };
        let response = self
            .send(self.client.post(&url).json(&body), WRITE_TIMEOUT, None)
            .await?;
        let project: ListProject = response.json().await?;

        let mut cache = self.projects.lock().await;
        if let Some(ref mut c) = *cache {
            c.names.insert(project.id.clone(), project.name.clone());
        }
        Ok(Some(project.id))
    }

    /// Normalize a native task
    async fn to_task(&self, raw: ListTask) -> Task {
        let project_ref = self.project_name(raw.project_id.as_deref()).await;
        let due_date = raw.due.as_ref().and_then(|d| parse_due(&d.date));
        if raw.due.is_some() && due_date.is_none() {
            warn!(native_id = %raw.id, "Ignoring unparsable due date");
        }

        let revision = revision_for(&raw);
        let fields = TaskFields {
            title: raw.content,
            project_ref,
            due_date,
            labels: raw.labels.into_iter().collect::<BTreeSet<_>>(),
            completed: raw.is_completed,
        };
        Task::from_fields(raw.id, SYSTEM, fields, revision)
    }

    async fn get_raw(&self, id: &NativeId) -> Result<Option<ListTask>> {
        let url = format!("{}/tasks/{}", self.base_url, id);
        match self.send(self.client.get(&url), GET_TIMEOUT, Some(id)).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(TaskSyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_completed(&self, id: &NativeId, completed: bool) -> Result<()> {
        let action = if completed { "close" } else { "reopen" };
        let url = format!("{}/tasks/{}/{}", self.base_url, id, action);
        debug!(native_id = %id, action, "Changing completion");
        self.send(self.client.post(&url), WRITE_TIMEOUT, Some(id))
            .await?;
        Ok(())
    }

    async fn write_body(&self, patch: &TaskPatch) -> Result<ListTaskWrite> {
        let mut body = ListTaskWrite {
            content: patch.title.clone(),
            labels: patch
                .labels
                .as_ref()
                .map(|labels| labels.iter().cloned().collect()),
            ..Default::default()
        };
        if let Some(ref project) = patch.project_ref {
            body.project_id = self.project_id(project.as_deref()).await?;
        }
        match patch.due_date {
            Some(Some(date)) => body.due_date = Some(date.format("%Y-%m-%d").to_string()),
            Some(None) => body.due_string = Some("no date".to_string()),
            None => {}
        }
        Ok(body)
    }

    async fn fetch_completed(&self) -> Result<Vec<ListTask>> {
        let url = format!("{}/tasks/completed", self.base_url);
        let response = self.send(self.client.get(&url), LIST_TIMEOUT, None).await?;
        let completed: CompletedTasksResponse = response.json().await?;
        Ok(completed
            .items
            .into_iter()
            .map(|mut t| {
                t.is_completed = true;
                t
            })
            .collect())
    }
}

#[async_trait]
impl Connector for ListServiceAdapter {
    fn system(&self) -> SourceSystem {
        SYSTEM
    }

    async fn fetch_all(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.ensure_projects().await?;

        let url = format!("{}/tasks", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(ref label) = filter.label {
            request = request.query(&[("label", label.as_str())]);
        }
        let response = self.send(request, LIST_TIMEOUT, None).await?;
        let mut raw: Vec<ListTask> = response.json().await?;

        if filter.include_completed {
            raw.extend(self.fetch_completed().await?);
        }

        let mut tasks = Vec::with_capacity(raw.len());
        for item in raw {
            let task = self.to_task(item).await;
            if filter.matches(&task) {
                tasks.push(task);
            }
        }

        info!(count = tasks.len(), "Fetched list service tasks");
        Ok(tasks)
    }

    async fn fetch_one(&self, id: &NativeId) -> Result<Option<Task>> {
        self.ensure_projects().await?;
        match self.get_raw(id).await? {
            Some(raw) => Ok(Some(self.to_task(raw).await)),
            None => Ok(None),
        }
    }

    async fn create(&self, fields: &TaskFields) -> Result<Task> {
        let patch = TaskPatch::from_fields(
            fields,
            &[
                crate::model::Field::Title,
                crate::model::Field::Project,
                crate::model::Field::DueDate,
                crate::model::Field::Labels,
            ],
        );
        let body = self.write_body(&patch).await?;

        let url = format!("{}/tasks", self.base_url);
        let response = self
            .send(self.client.post(&url).json(&body), WRITE_TIMEOUT, None)
            .await?;
        let created: ListTask = response.json().await?;
        let id = NativeId::new(created.id.clone());
        info!(native_id = %id, "Created list service task");

        if fields.completed {
            self.set_completed(&id, true).await?;
            if let Some(raw) = self.get_raw(&id).await? {
                return Ok(self.to_task(raw).await);
            }
        }
        Ok(self.to_task(created).await)
    }

    async fn update(&self, id: &NativeId, patch: &TaskPatch) -> Result<Task> {
        self.ensure_projects().await?;

        // The API has no conditional writes; compare revisions first
        let current = self
            .get_raw(id)
            .await?
            .ok_or_else(|| TaskSyncError::NotFound(format!("{} {}", SYSTEM, id)))?;
        if let Some(ref expected) = patch.expected_revision {
            let found = revision_for(&current).marker;
            if &found != expected {
                return Err(TaskSyncError::conflict(
                    id.as_str(),
                    format!("expected revision {}, found {}", expected, found),
                ));
            }
        }

        let body = self.write_body(patch).await?;
        if !body.is_empty() {
            let url = format!("{}/tasks/{}", self.base_url, id);
            self.send(self.client.post(&url).json(&body), WRITE_TIMEOUT, Some(id))
                .await?;
        }
        if let Some(completed) = patch.completed {
            if completed != current.is_completed {
                self.set_completed(id, completed).await?;
            }
        }

        debug!(native_id = %id, "Updated list service task");
        self.fetch_one(id)
            .await?
            .ok_or_else(|| TaskSyncError::NotFound(format!("{} {}", SYSTEM, id)))
    }

    async fn delete(&self, id: &NativeId) -> Result<()> {
        let url = format!("{}/tasks/{}", self.base_url, id);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(self.token()?)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error(SYSTEM, e))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => {
                info!(native_id = %id, "Deleted list service task");
                Ok(())
            }
            _ => Err(status_error(SYSTEM, Some(id), response).await),
        }
    }
}

fn parse_due(raw: &str) -> Option<NaiveDate> {
    let date = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// `updated_at` when the API reports it, otherwise a content hash
fn revision_for(raw: &ListTask) -> Revision {
    if let Some(ref updated) = raw.updated_at {
        if let Ok(at) = DateTime::parse_from_rfc3339(updated) {
            return Revision::new(updated.clone()).with_modified_at(at.with_timezone(&Utc));
        }
    }
    Revision::new(content_hash(raw))
}

fn content_hash(raw: &ListTask) -> String {
    let mut labels = raw.labels.clone();
    labels.sort();

    let mut hasher = Sha256::new();
    hasher.update(raw.content.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(raw.project_id.as_deref().unwrap_or_default().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(
        raw.due
            .as_ref()
            .map(|d| d.date.as_str())
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update(b"\x1f");
    hasher.update(labels.join(",").as_bytes());
    hasher.update(b"\x1f");
    hasher.update(if raw.is_completed { b"1" } else { b"0" });
    let digest = hasher.finalize();

    let hex: String = digest[..12].iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}
