//! Configuration system
//!
//! Loads ~/.config/tasksync/config.yaml with:
//! - List service and doc store connection settings
//! - Sync tuning (workers, throttling, retries, delete mode)
//! - Ledger location and HTTP API bind address

mod tasksync_config;
pub mod validation;

pub use tasksync_config::{
    DeleteMode, DocStoreConfig, ListServiceConfig, PropertyNames, RetrySettings, ServerConfig,
    StorageConfig, SyncSettings, TaskSyncConfig,
};
pub use validation::{validate_config, validate_config_result, Severity, ValidationIssue};
