//! Configuration validation
//!
//! Checks a TaskSync configuration before a run:
//! - Backend URLs are http(s)
//! - The doc store database id is set
//! - Worker and concurrency limits are non-zero
//! - Token environment variables are set (warning only; tokens are read lazily)

use super::tasksync_config::TaskSyncConfig;
use crate::TaskSyncError;
use serde::Serialize;

/// How bad a validation finding is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{} {}: {}", level, self.field, self.message)
    }
}

fn is_http_url(url: &str) -> bool {
    (url.starts_with("https://") || url.starts_with("http://")) && url.len() > "https://".len()
}

fn check_token_env(field: &str, env_var: &str, issues: &mut Vec<ValidationIssue>) {
    let name = env_var.trim_start_matches('$');
    if name.is_empty() {
        issues.push(ValidationIssue::error(field, "Token variable name cannot be empty"));
    } else if std::env::var(name).map(|v| v.trim().is_empty()).unwrap_or(true) {
        issues.push(ValidationIssue::warning(
            field,
            format!("Environment variable {} is not set", name),
        ));
    }
}

/// Validate a configuration, returning every finding
pub fn validate_config(config: &TaskSyncConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if !is_http_url(&config.list_service.api_url) {
        issues.push(ValidationIssue::error(
            "list_service.api_url",
            format!("Invalid URL: {}", config.list_service.api_url),
        ));
    }
    check_token_env("list_service.token_env", &config.list_service.token_env, &mut issues);
    if let Some(ref inbox) = config.list_service.inbox_project {
        if inbox.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "list_service.inbox_project",
                "Inbox project cannot be blank",
            ));
        }
    }

    if !is_http_url(&config.doc_store.api_url) {
        issues.push(ValidationIssue::error(
            "doc_store.api_url",
            format!("Invalid URL: {}", config.doc_store.api_url),
        ));
    }
    check_token_env("doc_store.token_env", &config.doc_store.token_env, &mut issues);
    if config.doc_store.database_id.trim().is_empty() {
        issues.push(ValidationIssue::error(
            "doc_store.database_id",
            "Database id is required",
        ));
    }
    for (role, name) in config.doc_store.properties.as_map() {
        if name.trim().is_empty() {
            issues.push(ValidationIssue::error(
                format!("doc_store.properties.{}", role),
                "Property name cannot be empty",
            ));
        }
    }

    if config.sync.max_workers == 0 {
        issues.push(ValidationIssue::error(
            "sync.max_workers",
            "Must be greater than 0",
        ));
    }
    if config.sync.per_backend_concurrency == 0 {
        issues.push(ValidationIssue::error(
            "sync.per_backend_concurrency",
            "Must be greater than 0",
        ));
    }
    if config.sync.event_channel_capacity == 0 {
        issues.push(ValidationIssue::error(
            "sync.event_channel_capacity",
            "Must be greater than 0",
        ));
    }
    if config.sync.retry.initial_backoff_ms > config.sync.retry.max_backoff_ms {
        issues.push(ValidationIssue::warning(
            "sync.retry",
            "initial_backoff_ms is larger than max_backoff_ms",
        ));
    }

    if config.server.bind.parse::<std::net::SocketAddr>().is_err() {
        issues.push(ValidationIssue::error(
            "server.bind",
            format!("Invalid socket address: {}", config.server.bind),
        ));
    }

    issues
}

/// Validate and turn any error-level finding into a `Config` error
pub fn validate_config_result(config: &TaskSyncConfig) -> crate::Result<Vec<ValidationIssue>> {
    let issues = validate_config(config);
    let errors: Vec<String> = issues
        .iter()
        .filter(|i| i.is_error())
        .map(|i| i.to_string())
        .collect();

    if errors.is_empty() {
        Ok(issues)
    } else {
        Err(TaskSyncError::Config(format!(
            "Configuration validation failed:\n  {}",
            errors.join("\n  ")
        )))
    }
}
