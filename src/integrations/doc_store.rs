//! Doc store adapter
//!
//! Talks to a Notion-style database API. Each page of the configured
//! database is a task; its columns are read through the property names in
//! the config. The page's `last_edited_time` is the revision, and deleting
//! a task archives its page.

use super::{status_error, token_from_env, transport_error, Connector, TaskFilter};
use crate::config::{DocStoreConfig, PropertyNames};
use crate::model::{NativeId, Revision, SourceSystem, Task, TaskFields, TaskPatch};
use crate::{Result, TaskSyncError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

const SYSTEM: SourceSystem = SourceSystem::DocStore;

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const GET_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest page size the query endpoint accepts
const PAGE_SIZE: u32 = 100;

/// Database page as returned by the doc store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocPage {
    pub id: String,
    #[serde(default)]
    pub last_edited_time: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<DocPage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct QueryRequest {
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
}

/// Client for the doc store
pub struct DocStoreAdapter {
    client: Client,
    config: DocStoreConfig,
    base_url: String,
    auth_token: Option<String>,
}

impl DocStoreAdapter {
    /// Create a new adapter; the token is read lazily on the first request
    pub fn new(config: DocStoreConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let base_url = config.api_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            config,
            base_url,
            auth_token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn props(&self) -> &PropertyNames {
        &self.config.properties
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
            .header("Notion-Version", &self.config.api_version)
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

    /// Server-side filter for a query, `None` when nothing restricts it
    fn query_filter(&self, filter: &TaskFilter) -> Option<Value> {
        let props = self.props();
        let mut clauses = Vec::new();
        if let Some(ref project) = filter.project {
            clauses.push(json!({ "property": props.project, "select": { "equals": project } }));
        }
        if let Some(ref label) = filter.label {
            clauses.push(json!({ "property": props.labels, "multi_select": { "contains": label } }));
        }
        if !filter.include_completed {
            clauses.push(json!({ "property": props.done, "checkbox": { "equals": false } }));
        }
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(json!({ "and": clauses })),
        }
    }

    /// Normalize a page into a task
    fn to_task(&self, page: DocPage) -> Task {
        let props = self.props();
        let title = read_title(page.properties.get(&props.title));
        let project_ref = page
            .properties
            .get(&props.project)
            .and_then(|v| v.get("select"))
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let due_raw = page
            .properties
            .get(&props.due)
            .and_then(|v| v.get("date"))
            .and_then(|d| d.get("start"))
            .and_then(Value::as_str);
        let due_date = due_raw.and_then(parse_date);
        if due_raw.is_some() && due_date.is_none() {
            warn!(native_id = %page.id, "Ignoring unparsable due date");
        }
        let labels = page
            .properties
            .get(&props.labels)
            .and_then(|v| v.get("multi_select"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();
        let completed = page
            .properties
            .get(&props.done)
            .and_then(|v| v.get("checkbox"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let revision = page_revision(&page);
        let fields = TaskFields {
            title,
            project_ref,
            due_date,
            labels,
            completed,
        };
        Task::from_fields(page.id, SYSTEM, fields, revision)
    }

    /// Property payload for the fields a patch sets
    fn properties_for(&self, patch: &TaskPatch) -> Map<String, Value> {
        let props = self.props();
        let mut properties = Map::new();
        if let Some(ref title) = patch.title {
            properties.insert(
                props.title.clone(),
                json!({ "title": [{ "text": { "content": title } }] }),
            );
        }
        if let Some(ref project) = patch.project_ref {
            let value = match project {
                Some(name) => json!({ "select": { "name": name } }),
                None => json!({ "select": null }),
            };
            properties.insert(props.project.clone(), value);
        }
        if let Some(due) = patch.due_date {
            let value = match due {
                Some(date) => json!({ "date": { "start": date.format("%Y-%m-%d").to_string() } }),
                None => json!({ "date": null }),
            };
            properties.insert(props.due.clone(), value);
        }
        if let Some(ref labels) = patch.labels {
            let names: Vec<Value> = labels.iter().map(|l| json!({ "name": l })).collect();
            properties.insert(props.labels.clone(), json!({ "multi_select": names }));
        }
        if let Some(completed) = patch.completed {
            properties.insert(props.done.clone(), json!({ "checkbox": completed }));
        }
        properties
    }

    async fn get_page(&self, id: &NativeId) -> Result<Option<DocPage>> {
        let url = format!("{}/pages/{}", self.base_url, id);
        match self.send(self.client.get(&url), GET_TIMEOUT, Some(id)).await {
            Ok(response) => {
                let page: DocPage = response.json().await?;
                Ok(if page.archived { None } else { Some(page) })
            }
            Err(TaskSyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Connector for DocStoreAdapter {
    fn system(&self) -> SourceSystem {
        SYSTEM
    }

    async fn fetch_all(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let url = format!("{}/databases/{}/query", self.base_url, self.config.database_id);
        let query_filter = self.query_filter(filter);
        let mut cursor: Option<String> = None;
        let mut tasks = Vec::new();

        loop {
            let body = QueryRequest {
                page_size: PAGE_SIZE,
                start_cursor: cursor.take(),
                filter: query_filter.clone(),
            };
            let response = self
                .send(self.client.post(&url).json(&body), QUERY_TIMEOUT, None)
                .await?;
            let batch: QueryResponse = response.json().await?;
            debug!(count = batch.results.len(), has_more = batch.has_more, "Doc store page");

            for page in batch.results.into_iter().filter(|p| !p.archived) {
                let task = self.to_task(page);
                if filter.matches(&task) {
                    tasks.push(task);
                }
            }

            match (batch.has_more, batch.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        info!(count = tasks.len(), "Fetched doc store tasks");
        Ok(tasks)
    }

    async fn fetch_one(&self, id: &NativeId) -> Result<Option<Task>> {
        Ok(self.get_page(id).await?.map(|page| self.to_task(page)))
    }

    async fn create(&self, fields: &TaskFields) -> Result<Task> {
        let mut patch = TaskPatch::from_fields(fields, &crate::model::Field::ALL);
        // an unset select or date is simply omitted on create
        if fields.project_ref.is_none() {
            patch.project_ref = None;
        }
        if fields.due_date.is_none() {
            patch.due_date = None;
        }

        let url = format!("{}/pages", self.base_url);
        let body = json!({
            "parent": { "database_id": self.config.database_id },
            "properties": self.properties_for(&patch),
        });
        let response = self
            .send(self.client.post(&url).json(&body), WRITE_TIMEOUT, None)
            .await?;
        let page: DocPage = response.json().await?;
        info!(native_id = %page.id, "Created doc store page");
        Ok(self.to_task(page))
    }

    async fn update(&self, id: &NativeId, patch: &TaskPatch) -> Result<Task> {
        // No conditional writes in the API; compare revisions first
        if let Some(ref expected) = patch.expected_revision {
            let current = self
                .get_page(id)
                .await?
                .ok_or_else(|| TaskSyncError::NotFound(format!("{} {}", SYSTEM, id)))?;
            let found = page_revision(&current).marker;
            if &found != expected {
                return Err(TaskSyncError::conflict(
                    id.as_str(),
                    format!("expected revision {}, found {}", expected, found),
                ));
            }
        }

        let url = format!("{}/pages/{}", self.base_url, id);
        let body = json!({ "properties": self.properties_for(patch) });
        let response = self
            .send(self.client.patch(&url).json(&body), WRITE_TIMEOUT, Some(id))
            .await?;
        let page: DocPage = response.json().await?;
        debug!(native_id = %id, "Updated doc store page");
        Ok(self.to_task(page))
    }

    async fn delete(&self, id: &NativeId) -> Result<()> {
        let url = format!("{}/pages/{}", self.base_url, id);
        self.send(
            self.client.patch(&url).json(&json!({ "archived": true })),
            WRITE_TIMEOUT,
            Some(id),
        )
        .await?;
        info!(native_id = %id, "Archived doc store page");
        Ok(())
    }
}

fn read_title(value: Option<&Value>) -> String {
    value
        .and_then(|v| v.get("title"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| {
                    p.get("plain_text")
                        .or_else(|| p.get("text").and_then(|t| t.get("content")))
                        .and_then(Value::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let date = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn page_revision(page: &DocPage) -> Revision {
    match page.last_edited_time {
        Some(ref edited) => {
            let revision = Revision::new(edited.clone());
            match DateTime::parse_from_rfc3339(edited) {
                Ok(at) => revision.with_modified_at(at.with_timezone(&Utc)),
                Err(_) => revision,
            }
        }
        None => Revision::new(""),
    }
}
