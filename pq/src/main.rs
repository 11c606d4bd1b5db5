//! pushqueue - per-endpoint remote execution queue
//!
//! CLI entry point for running the dispatcher and managing actions.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use pushqueue::cli::{ActionCommand, Cli, Command, EndpointCommand, OutputFormat, generate_after_help, get_log_path};
use pushqueue::config::Config;
use pushqueue::{
    ActionStore, CommandChannel, CycleReport, ExecutionStatus, NewAction, Poller, ProbeOutcome, ProcedureDescriptor,
    RecordOutcome, SqliteStore, TaskDispatcher, TaskScheduler,
};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn open_store(cli_db: Option<&PathBuf>, config: &Config) -> Result<Arc<SqliteStore>> {
    let path = cli_db.cloned().unwrap_or_else(|| PathBuf::from(&config.storage.db_path));
    debug!(?path, "open_store: called");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&path).context(format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_dispatcher(store: Arc<SqliteStore>, config: &Config) -> TaskDispatcher {
    let channel = Arc::new(CommandChannel::new(config.channel.clone()));
    TaskDispatcher::new(store, channel).with_default_retries(config.dispatch.default_retries)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;
    config.validate()?;

    let store = open_store(cli.db.as_ref(), &config)?;

    match cli.command {
        Command::Run => cmd_run(store, &config).await,
        Command::Cycle { endpoint, format } => cmd_cycle(store, &config, &endpoint, format).await,
        Command::Action { command } => match command {
            ActionCommand::Add {
                name,
                function,
                args,
                endpoints,
                at,
                prerequisite,
                retries,
            } => cmd_action_add(
                store.as_ref(),
                &config,
                name,
                function,
                args,
                endpoints,
                at,
                prerequisite,
                retries,
            ),
            ActionCommand::List {
                endpoint,
                status,
                format,
            } => cmd_action_list(store.as_ref(), endpoint.as_deref(), status.as_deref(), format),
        },
        Command::Endpoint { command } => match command {
            EndpointCommand::List { format } => cmd_endpoint_list(store.as_ref(), format),
        },
    }
}

/// Poll and dispatch until Ctrl-C
async fn cmd_run(store: Arc<SqliteStore>, config: &Config) -> Result<()> {
    debug!("cmd_run: called");
    let dispatcher = Arc::new(build_dispatcher(store.clone(), config));
    let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone(), dispatcher));
    let poller = Poller::new(store, scheduler);

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move { poller.run(shutdown_rx).await });

    println!("{} polling every {}s (Ctrl-C to stop)", "pushqueue".bold(), config.scheduler.poll_interval_secs);
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");
    let _ = shutdown_tx.send(()).await;

    handle.await.context("Poller task failed")??;
    Ok(())
}

/// Run one cycle and print its report
async fn cmd_cycle(store: Arc<SqliteStore>, config: &Config, endpoint: &str, format: OutputFormat) -> Result<()> {
    debug!(%endpoint, %format, "cmd_cycle: called");
    let dispatcher = build_dispatcher(store, config);
    let report = dispatcher
        .run_cycle(endpoint)
        .await
        .context(format!("Dispatch cycle for {} failed", endpoint))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!("Cycle {} on {}", report.cycle_id, report.endpoint.bold());
    for outcome in &report.outcomes {
        let label = match outcome {
            RecordOutcome::Completed { .. } => outcome.label().green(),
            RecordOutcome::Held { .. } | RecordOutcome::Skipped { .. } | RecordOutcome::NoResult { .. } => {
                outcome.label().yellow()
            }
            _ => outcome.label().red(),
        };
        let detail = match outcome {
            RecordOutcome::Failed { message, .. } => format!(" {}", message),
            RecordOutcome::Error { error, .. } => format!(" {}", error),
            RecordOutcome::Held { prerequisite, .. } => format!(" waiting on action {}", prerequisite),
            _ => String::new(),
        };
        println!("  action {:>6}  {}{}", outcome.action_id(), label, detail);
    }
    if let Some(id) = report.checkpoint {
        println!("  package list refresh scheduled as action {}", id);
    }
    match &report.probe {
        Some(ProbeOutcome::Alive) => println!("  probe: {}", "alive".green()),
        Some(ProbeOutcome::Silent) => println!("  probe: {}", "no answer".yellow()),
        Some(ProbeOutcome::Unreachable(e)) => println!("  probe: {} {}", "unreachable".red(), e),
        None => {}
    }
    println!("  {} remote call(s), {} deferred", report.remote_calls, report.deferred);
}

/// Argument values are JSON when they parse as JSON, plain strings otherwise
fn parse_arg(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[allow(clippy::too_many_arguments)]
fn cmd_action_add(
    store: &SqliteStore,
    config: &Config,
    name: String,
    function: String,
    args: Vec<String>,
    endpoints: Vec<String>,
    at: Option<String>,
    prerequisite: Option<i64>,
    retries: Option<u32>,
) -> Result<()> {
    debug!(%name, %function, ?endpoints, "cmd_action_add: called");
    let scheduled_at = match at {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .context(format!("Invalid --at timestamp: {}", s))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let procedure = args
        .into_iter()
        .fold(ProcedureDescriptor::new(function), |p, a| p.with_arg(parse_arg(a)));
    let mut action = NewAction::new(name, procedure, scheduled_at)
        .with_retries(retries.unwrap_or(config.dispatch.default_retries));
    action.endpoints = endpoints;
    if let Some(id) = prerequisite {
        action = action.after(id);
    }

    let created = store.create_action(action).context("Failed to create action")?;
    println!(
        "{} action {} ({}) scheduled at {}",
        "Created".green(),
        created.id,
        created.procedure,
        created.scheduled_at.to_rfc3339()
    );
    Ok(())
}

fn cmd_action_list(
    store: &SqliteStore,
    endpoint: Option<&str>,
    status: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    debug!(?endpoint, ?status, "cmd_action_list: called");
    let status = status
        .map(|s| s.parse::<ExecutionStatus>())
        .transpose()
        .map_err(|e| eyre::eyre!(e))?;
    let records = store.records(endpoint, status)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No execution records");
                return Ok(());
            }
            println!(
                "{:<8} {:<20} {:<10} {:>5} {:>6}  MESSAGE",
                "ACTION", "ENDPOINT", "STATUS", "TRIES", "CODE"
            );
            for r in records {
                let padded = format!("{:<10}", r.status);
                let status = match r.status {
                    ExecutionStatus::Queued => padded.yellow(),
                    ExecutionStatus::Completed => padded.green(),
                    ExecutionStatus::Failed => padded.red(),
                };
                println!(
                    "{:<8} {:<20} {} {:>5} {:>6}  {}",
                    r.action_id,
                    r.endpoint,
                    status,
                    r.remaining_tries,
                    r.result_code.map(|c| c.to_string()).unwrap_or_default(),
                    r.result_msg.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn cmd_endpoint_list(store: &SqliteStore, format: OutputFormat) -> Result<()> {
    debug!("cmd_endpoint_list: called");
    let endpoints = store.endpoints()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&endpoints)?),
        OutputFormat::Text => {
            if endpoints.is_empty() {
                println!("No endpoints");
                return Ok(());
            }
            println!("{:<20} {:<8} LAST CHECK-IN", "ENDPOINT", "REFRESH");
            for ep in endpoints {
                println!(
                    "{:<20} {:<8} {}",
                    ep.id,
                    if ep.needs_refresh { "pending" } else { "-" },
                    ep.last_checkin.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
                );
            }
        }
    }
    Ok(())
}
