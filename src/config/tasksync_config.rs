//! TaskSync configuration file handling
//!
//! Loads and manages ~/.config/tasksync/config.yaml. Tokens are never
//! stored in the file; each backend section names the environment variable
//! that holds its token.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

fn config_dir() -> PathBuf {
    // ~/.config on every platform, same as the ledger
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("tasksync");
    path
}

/// List service (Todoist-style) connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListServiceConfig {
    #[serde(default = "default_list_api_url")]
    pub api_url: String,

    /// Environment variable holding the API token
    #[serde(default = "default_list_token_env")]
    pub token_env: String,

    /// Project that orphan tasks are moved into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox_project: Option<String>,
}

fn default_list_api_url() -> String {
    "https://api.todoist.com/rest/v2".to_string()
}

fn default_list_token_env() -> String {
    "TASKSYNC_LIST_TOKEN".to_string()
}

impl Default for ListServiceConfig {
    fn default() -> Self {
        Self {
            api_url: default_list_api_url(),
            token_env: default_list_token_env(),
            inbox_project: None,
        }
    }
}

/// Doc store (Notion-style) connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocStoreConfig {
    #[serde(default = "default_doc_api_url")]
    pub api_url: String,

    #[serde(default = "default_doc_token_env")]
    pub token_env: String,

    /// Database whose pages are the tasks
    #[serde(default)]
    pub database_id: String,

    /// Value of the API version header
    #[serde(default = "default_doc_api_version")]
    pub api_version: String,

    /// Column names of the task database
    #[serde(default)]
    pub properties: PropertyNames,
}

fn default_doc_api_url() -> String {
    "https://api.notion.com/v1".to_string()
}

fn default_doc_token_env() -> String {
    "TASKSYNC_DOC_TOKEN".to_string()
}

fn default_doc_api_version() -> String {
    "2022-06-28".to_string()
}

impl Default for DocStoreConfig {
    fn default() -> Self {
        Self {
            api_url: default_doc_api_url(),
            token_env: default_doc_token_env(),
            database_id: String::new(),
            api_version: default_doc_api_version(),
            properties: PropertyNames::default(),
        }
    }
}

/// Property names of the doc store task database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyNames {
    #[serde(default = "default_title_property")]
    pub title: String,
    #[serde(default = "default_project_property")]
    pub project: String,
    #[serde(default = "default_due_property")]
    pub due: String,
    #[serde(default = "default_labels_property")]
    pub labels: String,
    #[serde(default = "default_done_property")]
    pub done: String,
}

fn default_title_property() -> String {
    "Name".to_string()
}

fn default_project_property() -> String {
    "Project".to_string()
}

fn default_due_property() -> String {
    "Due".to_string()
}

fn default_labels_property() -> String {
    "Tags".to_string()
}

fn default_done_property() -> String {
    "Done".to_string()
}

impl Default for PropertyNames {
    fn default() -> Self {
        Self {
            title: default_title_property(),
            project: default_project_property(),
            due: default_due_property(),
            labels: default_labels_property(),
            done: default_done_property(),
        }
    }
}

impl PropertyNames {
    /// Property names keyed by role, for display
    pub fn as_map(&self) -> BTreeMap<&'static str, &str> {
        BTreeMap::from([
            ("title", self.title.as_str()),
            ("project", self.project.as_str()),
            ("due", self.due.as_str()),
            ("labels", self.labels.as_str()),
            ("done", self.done.as_str()),
        ])
    }
}

/// What applying a delete does to the surviving counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Mark the counterpart completed
    #[default]
    Complete,
    /// Delete the counterpart
    Hard,
}

/// Backoff settings for adapter calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Sync run tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub delete_mode: DeleteMode,

    /// Independent linked pairs processed concurrently during apply
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// In-flight requests allowed per backend
    #[serde(default = "default_per_backend_concurrency")]
    pub per_backend_concurrency: usize,

    /// Minimum spacing between request starts per backend
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Reports kept in the run history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Age after which an apply lock left by a crashed process is taken over
    #[serde(default = "default_run_lock_timeout_secs")]
    pub run_lock_timeout_secs: u64,
}

fn default_max_workers() -> usize {
    4
}

fn default_per_backend_concurrency() -> usize {
    2
}

fn default_min_request_interval_ms() -> u64 {
    350
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_history_limit() -> usize {
    50
}

fn default_run_lock_timeout_secs() -> u64 {
    1800
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            delete_mode: DeleteMode::default(),
            max_workers: default_max_workers(),
            per_backend_concurrency: default_per_backend_concurrency(),
            min_request_interval_ms: default_min_request_interval_ms(),
            retry: RetrySettings::default(),
            event_channel_capacity: default_event_channel_capacity(),
            history_limit: default_history_limit(),
            run_lock_timeout_secs: default_run_lock_timeout_secs(),
        }
    }
}

/// Ledger location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    config_dir().join("ledger.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// TaskSync configuration
///
/// Represents the complete ~/.config/tasksync/config.yaml file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskSyncConfig {
    #[serde(default)]
    pub list_service: ListServiceConfig,

    #[serde(default)]
    pub doc_store: DocStoreConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl TaskSyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default path (~/.config/tasksync/config.yaml)
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::TaskSyncError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading TaskSync configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            database_id = %config.doc_store.database_id,
            max_workers = config.sync.max_workers,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving TaskSync configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/tasksync/config.yaml)
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }
}
