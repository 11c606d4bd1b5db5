//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// pushqueue - per-endpoint remote execution queue
#[derive(Parser)]
#[command(
    name = "pq",
    about = "Dispatch scheduled actions to managed endpoints",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// SQLite database path (overrides storage.db-path)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll for due work and dispatch it until Ctrl-C
    Run,

    /// Run a single dispatch cycle for one endpoint
    Cycle {
        /// Endpoint id
        endpoint: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Manage actions
    Action {
        #[command(subcommand)]
        command: ActionCommand,
    },

    /// Manage endpoints
    Endpoint {
        #[command(subcommand)]
        command: EndpointCommand,
    },
}

/// Action subcommands
#[derive(Debug, Subcommand)]
pub enum ActionCommand {
    /// Create an action for one or more endpoints
    Add {
        /// Human readable name
        #[arg(short, long)]
        name: String,

        /// Remote function, e.g. pkg.install
        #[arg(short, long)]
        function: String,

        /// Positional argument; parsed as JSON, or taken as a plain string
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Target endpoint (repeatable)
        #[arg(short, long = "endpoint", required = true)]
        endpoints: Vec<String>,

        /// Earliest dispatch time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,

        /// Action that must succeed first on the same endpoint
        #[arg(short, long)]
        prerequisite: Option<i64>,

        /// Retry budget (defaults to dispatch.default-retries)
        #[arg(short, long)]
        retries: Option<u32>,
    },

    /// List execution records
    List {
        /// Only this endpoint
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Only this status (queued, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Endpoint subcommands
#[derive(Debug, Subcommand)]
pub enum EndpointCommand {
    /// List known endpoints
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pushqueue")
        .join("logs")
        .join("pushqueue.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Generate the after_help text
pub fn generate_after_help() -> String {
    format!("Logs are written to: {}\n", get_log_path().display())
}

/// Output format for listing commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
