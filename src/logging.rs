//! Logging configuration using tracing
//!
//! Structured logging to stderr, filtered through the RUST_LOG environment
//! variable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line human readable output, for the CLI
    #[default]
    Pretty,
    /// Single-line output, for the long-running server
    Compact,
}

/// Initialize the tracing subscriber
///
/// Filtering follows RUST_LOG, defaulting to `default_level` when unset.
///
/// # Example RUST_LOG values
/// - `RUST_LOG=info` - Show info and above
/// - `RUST_LOG=tasksync=debug` - Debug level for this crate only
/// - `RUST_LOG=tasksync::sync=trace,reqwest=info` - Per-module levels
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init_with(format: LogFormat, default_level: &str) -> crate::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .pretty(),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .compact(),
            )
            .try_init(),
    };

    result.map_err(|e| {
        crate::TaskSyncError::Other(format!("Failed to initialize tracing: {}", e))
    })
}

/// Initialize CLI logging, quiet by default
pub fn init() -> crate::Result<()> {
    init_with(LogFormat::Pretty, "warn")
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}
