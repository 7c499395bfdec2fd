//! TaskSync - bidirectional task synchronization
//!
//! Keeps a Todoist-style list service and a Notion-style document database
//! in agreement about a set of tasks. Every run is previewed as a change
//! set before anything is written, and only confirmed items are applied.
//!
//! # Architecture
//!
//! - **model**: canonical tasks, sync links and change sets
//! - **integrations**: backend adapters, throttling and retries
//! - **ledger**: persistent link store and run history (SQLite)
//! - **diff**: pure change set computation
//! - **resolver**: conflict resolution policies
//! - **sync**: preview/apply orchestration and progress events
//! - **api**: HTTP interface (axum)
//! - **tools**: maintenance operations outside the sync loop
//! - **config**: YAML configuration

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;

// Engine
pub mod diff;
pub mod integrations;
pub mod ledger;
pub mod resolver;
pub mod sync;

// Surfaces
pub mod api;
pub mod tools;

// Re-exports
pub use error::{Result, TaskSyncError};
