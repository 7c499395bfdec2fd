//! TaskSync - bidirectional task synchronization
//!
//! Main entry point for the TaskSync CLI.

use clap::{Args, Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tasksync::api::ApiServer;
use tasksync::config::{validate_config, TaskSyncConfig};
use tasksync::integrations::{Connector, MemoryConnector, RetryConfig, TaskFilter};
use tasksync::ledger::MemoryLedger;
use tasksync::logging::{self, LogFormat};
use tasksync::model::{ChangeSet, SourceSystem, StepId, TaskFields};
use tasksync::sync::{
    CancelToken, ItemOutcome, Selections, StepKind, SyncEvent, SyncOrchestrator, SyncReport,
};
use tasksync::tools;
use tasksync::TaskSyncError;
use tokio::sync::broadcast;

/// TaskSync - keep a task list and a document database in agreement
#[derive(Parser, Debug)]
#[command(name = "tasksync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/tasksync/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Run against in-memory demo backends instead of the real services
    #[arg(long, global = true)]
    dry_backend: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Only tasks in this project
    #[arg(short, long)]
    project: Option<String>,

    /// Only tasks carrying this label
    #[arg(short, long)]
    label: Option<String>,

    /// Leave completed tasks out of the fetch
    #[arg(long)]
    open_only: bool,
}

impl FilterArgs {
    fn to_filter(&self) -> TaskFilter {
        TaskFilter {
            project: self.project.clone(),
            include_completed: !self.open_only,
            label: self.label.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Show what a sync would change, without writing anything
    Preview {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Preview, confirm, then apply a sync
    Apply {
        #[command(flatten)]
        filter: FilterArgs,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Apply only these step ids (repeatable)
        #[arg(long = "only", value_name = "STEP_ID")]
        only: Vec<String>,

        /// Select every non-deferred item, including conflicts and deletes
        #[arg(long, conflicts_with = "only")]
        all: bool,
    },

    /// Show past sync runs
    History {
        /// Number of runs to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Run the HTTP API
    Serve {
        /// Address to bind (default: server.bind from config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Find or clean up list service tasks without a project
    #[command(subcommand)]
    Orphans(OrphanCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Check the configuration for problems
    Validate,
}

#[derive(Subcommand, Debug)]
enum OrphanCommands {
    /// List tasks without a project
    Find,

    /// Move tasks without a project into the inbox project
    Move {
        /// Target project (default: list_service.inbox_project from config)
        #[arg(short, long)]
        inbox: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_result = match cli.command {
        Commands::Serve { .. } => logging::init_with(LogFormat::Compact, "info"),
        _ => logging::init(),
    };
    if let Err(e) = log_result {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> tasksync::Result<()> {
    // Commands that work on the config file itself
    match cli.command {
        Commands::Init { force } => return handle_init_command(&cli.config, force),
        Commands::Config(ref cmd) => return handle_config_command(cmd, &cli),
        _ => {}
    }

    let config = load_config(&cli)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(cli, config))
}

async fn run_async(cli: Cli, config: TaskSyncConfig) -> tasksync::Result<()> {
    let orchestrator = if cli.dry_backend {
        demo_orchestrator(&config)?
    } else {
        SyncOrchestrator::from_config(&config)?
    };

    match cli.command {
        Commands::Preview { ref filter } => {
            let change_set = orchestrator.preview(&filter.to_filter()).await?;
            if cli.json {
                print_json(&change_set)?;
            } else {
                print_change_set(&change_set);
            }
        }

        Commands::Apply {
            ref filter,
            yes,
            ref only,
            all,
        } => {
            let change_set = orchestrator.preview(&filter.to_filter()).await?;
            if !cli.json {
                print_change_set(&change_set);
            }
            if change_set.is_empty() && change_set.ledger_refreshes.is_empty() {
                if !cli.json {
                    println!("Nothing to apply.");
                }
                return Ok(());
            }

            let selections = if !only.is_empty() {
                Selections::only(only.iter().map(|s| StepId::new(s.as_str())))
            } else if all {
                Selections::All
            } else {
                Selections::defaults_for(&change_set)
            };

            if !yes && !confirm("Apply the selected changes?")? {
                println!("Aborted, nothing was written.");
                return Ok(());
            }

            let cancel = CancelToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Cancelling after the items in flight...");
                    ctrl_c_cancel.cancel();
                }
            });

            let printer = tokio::spawn(print_events(orchestrator.subscribe(), cli.json));
            let report = orchestrator
                .apply_by_id(&change_set.id, &selections, &cancel)
                .await?;
            // the printer stops at the run's completion event
            let _ = printer.await;

            if cli.json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }

        Commands::History { limit } => {
            let reports = orchestrator.history(limit)?;
            if cli.json {
                print_json(&reports)?;
            } else if reports.is_empty() {
                println!("No sync runs recorded yet.");
            } else {
                for report in &reports {
                    println!(
                        "{}  {:<10} applied {:>3}  failed {:>3}  skipped {:>3}  deferred {:>3}  ({} ms)",
                        report.started_at.format("%Y-%m-%d %H:%M:%S"),
                        report.outcome.label(),
                        report.totals.total_applied,
                        report.totals.total_failed,
                        report.totals.total_skipped,
                        report.totals.total_deferred,
                        report.elapsed_ms
                    );
                }
            }
        }

        Commands::Serve { ref bind } => {
            let addr = bind.clone().unwrap_or_else(|| config.server.bind.clone());
            ApiServer::new(Arc::new(orchestrator))
                .run(&addr)
                .await
                .map_err(|e| TaskSyncError::Other(e.to_string()))?;
        }

        Commands::Orphans(ref cmd) => {
            let list = orchestrator.connector(SourceSystem::ListService).clone();
            handle_orphans_command(cmd, &cli, &config, &orchestrator, list.as_ref()).await?;
        }

        Commands::Init { .. } | Commands::Config(_) => {
            unreachable!("Init and Config commands are handled before loading the config")
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> tasksync::Result<TaskSyncConfig> {
    let result = match cli.config {
        Some(ref path) => TaskSyncConfig::load(path),
        None => TaskSyncConfig::load_default(),
    };

    match result {
        Ok(config) => Ok(config),
        Err(TaskSyncError::Config(msg)) if msg.contains("Config file not found") => {
            if cli.dry_backend {
                tracing::info!("No config file, using defaults for the demo backends");
                Ok(TaskSyncConfig::default())
            } else {
                Err(TaskSyncError::Config(format!(
                    "{}\n\nRun 'tasksync init' first to create one.",
                    msg
                )))
            }
        }
        Err(e) => Err(e),
    }
}

fn config_path(config: &Option<String>) -> PathBuf {
    config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(TaskSyncConfig::default_path)
}

fn handle_init_command(config: &Option<String>, force: bool) -> tasksync::Result<()> {
    let path = config_path(config);

    if path.exists() && !force {
        println!("Configuration already exists at {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    TaskSyncConfig::default().save(&path)?;
    println!("Created configuration at {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set doc_store.database_id in the file");
    println!("  2. Export TASKSYNC_LIST_TOKEN and TASKSYNC_DOC_TOKEN");
    println!("  3. Run 'tasksync preview'");
    Ok(())
}

fn handle_config_command(cmd: &ConfigCommands, cli: &Cli) -> tasksync::Result<()> {
    let config = load_config(cli)?;
    match cmd {
        ConfigCommands::Show => {
            if cli.json {
                print_json(&config)?;
            } else {
                print!("{}", serde_yaml::to_string(&config)?);
            }
        }
        ConfigCommands::Validate => {
            let issues = validate_config(&config);
            if cli.json {
                print_json(&issues)?;
            } else if issues.is_empty() {
                println!("Configuration is valid.");
            } else {
                for issue in &issues {
                    println!("{}", issue);
                }
            }
            let errors = issues.iter().filter(|i| i.is_error()).count();
            if errors > 0 {
                return Err(TaskSyncError::Config(format!(
                    "{} configuration error(s)",
                    errors
                )));
            }
        }
    }
    Ok(())
}

async fn handle_orphans_command(
    cmd: &OrphanCommands,
    cli: &Cli,
    config: &TaskSyncConfig,
    orchestrator: &SyncOrchestrator,
    list: &dyn Connector,
) -> tasksync::Result<()> {
    let orphans = tools::find_orphans(list, &TaskFilter::all()).await?;

    match cmd {
        OrphanCommands::Find => {
            if cli.json {
                print_json(&orphans)?;
            } else {
                println!("Tasks without a project: {}", orphans.len());
                for task in &orphans {
                    println!("  {}  {}", task.id, task.title);
                }
            }
        }
        OrphanCommands::Move { inbox, yes } => {
            let inbox = inbox
                .clone()
                .or_else(|| config.list_service.inbox_project.clone())
                .ok_or_else(|| {
                    TaskSyncError::Config(
                        "No inbox project: pass --inbox or set list_service.inbox_project"
                            .to_string(),
                    )
                })?;

            if orphans.is_empty() {
                println!("No tasks without a project.");
                return Ok(());
            }
            if !*yes && !confirm(&format!("Move {} task(s) to {}?", orphans.len(), inbox))? {
                println!("Aborted, nothing was moved.");
                return Ok(());
            }

            let printer = tokio::spawn(print_events(orchestrator.subscribe(), cli.json));
            let report = tools::move_orphans_to_inbox(
                list,
                &inbox,
                &orphans,
                orchestrator.events(),
                &RetryConfig::from_settings(&config.sync.retry),
            )
            .await?;
            let _ = printer.await;

            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "Moved {} task(s) to {}, {} failed",
                    report.moved_count(),
                    report.inbox_project,
                    report.failed_count()
                );
                for failure in &report.failed {
                    println!("  ✗ {}  {}: {}", failure.native_id, failure.title, failure.error);
                }
            }
        }
    }
    Ok(())
}

/// Orchestrator over seeded in-memory backends
fn demo_orchestrator(config: &TaskSyncConfig) -> tasksync::Result<SyncOrchestrator> {
    let list = Arc::new(MemoryConnector::new(SourceSystem::ListService));
    let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
    let due = chrono::Utc::now().date_naive() + chrono::Duration::days(2);

    list.add_task(
        "li-1",
        TaskFields::new("Revisar propuesta de cliente ABC")
            .with_project("Trabajo")
            .with_due_date(due),
    )?;
    list.add_task(
        "li-2",
        TaskFields::new("Comprar regalo de cumpleaños").with_label("personal"),
    )?;
    list.add_task(
        "li-3",
        TaskFields::new("Renovar pasaporte").with_project("Personal"),
    )?;
    doc.add_task(
        "pg-1",
        TaskFields::new("revisar propuesta de cliente abc")
            .with_project("Trabajo")
            .with_due_date(due),
    )?;
    doc.add_task(
        "pg-2",
        TaskFields::new("Preparar presentación Q3").with_project("Trabajo"),
    )?;

    Ok(SyncOrchestrator::new(list, doc, Arc::new(MemoryLedger::new()))
        .with_settings(tasksync::sync::OrchestratorSettings::from_settings(&config.sync)))
}

fn confirm(prompt: &str) -> tasksync::Result<bool> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| TaskSyncError::Other(format!("Prompt failed: {}", e)))
}

fn print_json<T: serde::Serialize>(value: &T) -> tasksync::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print progress events until the run completes
async fn print_events(mut rx: broadcast::Receiver<SyncEvent>, json: bool) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        } else if let SyncEvent::Step(ref step) = event {
            let marker = match step.kind {
                StepKind::Started => "…",
                StepKind::Progress => "·",
                StepKind::Completed => "✓",
                StepKind::Failed => "✗",
            };
            let pct = step
                .progress_pct
                .map(|p| format!("{:>3}%", p))
                .unwrap_or_else(|| "    ".to_string());
            println!(
                "{} {} {}{}",
                pct,
                marker,
                step.step_id,
                step.detail
                    .as_ref()
                    .map(|d| format!("  {}", d))
                    .unwrap_or_default()
            );
        }
        if event.is_run_completed() {
            break;
        }
    }
}

fn print_change_set(change_set: &ChangeSet) {
    let summary = change_set.summary();
    println!("Change set {}", change_set.id);
    println!(
        "  {} tasks: {} to create, {} to update, {} conflicts, {} deletes, {} invalid",
        summary.total_tasks,
        summary.creates,
        summary.updates,
        summary.conflicts,
        summary.deletes,
        summary.invalid
    );
    if !summary.projects.is_empty() {
        println!("  Projects: {}", summary.projects.join(", "));
    }
    println!();

    for item in &change_set.creates {
        println!("  [create]   {}  {} → {}", item.step_id, item.task.title, item.target);
    }
    for item in &change_set.updates {
        let fields: Vec<String> = item.changed_fields.iter().map(|f| f.to_string()).collect();
        println!(
            "  [update]   {}  {} ({}) → {}",
            item.step_id,
            item.source.title,
            fields.join(", "),
            item.target
        );
    }
    for item in &change_set.conflicts {
        let proposal = match item.proposed {
            Some(ref resolution) if resolution.is_defer() => "deferred".to_string(),
            Some(ref resolution) => format!("{:?}", resolution),
            None => "unresolved".to_string(),
        };
        println!(
            "  [conflict] {}  {} vs {} ({})",
            item.step_id, item.list_task.title, item.doc_task.title, proposal
        );
    }
    for item in &change_set.deletes {
        println!("  [delete]   {}  link {}", item.step_id, item.link.link_id);
    }
    for item in &change_set.invalid {
        println!(
            "  [invalid]  {}  {} {}: {}",
            item.step_id, item.system, item.native_id, item.reason
        );
    }
    println!();
}

fn print_report(report: &SyncReport) {
    println!();
    println!(
        "Run {} {} in {} ms",
        report.run_id,
        report.outcome.label(),
        report.elapsed_ms
    );
    println!(
        "  applied {}, failed {}, skipped {}, deferred {}",
        report.totals.total_applied,
        report.totals.total_failed,
        report.totals.total_skipped,
        report.totals.total_deferred
    );
    for item in &report.items {
        match item.outcome {
            ItemOutcome::Failed { ref error, .. } => {
                println!("  ✗ {}  {}: {}", item.step_id, item.title, error)
            }
            ItemOutcome::Deferred { ref reason } => {
                println!("  ? {}  {}: {}", item.step_id, item.title, reason)
            }
            _ => {}
        }
    }
}
