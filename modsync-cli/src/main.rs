//! modsync - Magisk/KernelSU module manager
//!
//! Thin front-end over `modsync_core`: every command builds the components it
//! needs from the loaded configuration and drives them to completion.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod app;
mod install_cli;
mod local_cli;
mod repo_cli;

use app::App;

/// Trace targets for structured JSON output
#[derive(Debug, Clone, ValueEnum)]
enum TraceModule {
    Sync,
    Repo,
    Local,
    Install,
    Net,
    All,
}

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "modsync",
    about = "Browse module repositories, manage installed modules and install module zips",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Enable JSON tracing (comma-separated: sync,repo,local,install,net,all)
    #[clap(long, value_delimiter = ',', global = true)]
    trace: Vec<TraceModule>,

    /// Set log level
    #[clap(long, default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Override configuration file path
    #[clap(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Manage module repositories
    Repo {
        #[clap(subcommand)]
        command: repo_cli::RepoCommand,
    },

    /// Refresh every enabled repository and print the merged catalog
    Sync {
        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Search the cached catalog by id, name, author or description
    Search {
        query: String,

        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Manage installed modules
    Local {
        #[clap(subcommand)]
        command: local_cli::LocalCommand,
    },

    /// Install a module zip from a local path or an https:// URL
    Install(install_cli::InstallArgs),
}

/// Initialize tracing with CLI flags
///
/// Configures logging based on --log-level and --trace flags.
/// When --trace is set, enables JSON output for structured tracing.
fn initialize_tracing(log_level: &LogLevel, trace_modules: &[TraceModule]) {
    let mut filter = EnvFilter::new(log_level.to_filter_directive());

    for module in trace_modules {
        let directive = match module {
            TraceModule::Sync => "modsync_core::sync=trace",
            TraceModule::Repo => "modsync_core::repo=trace",
            TraceModule::Local => "modsync_core::local=trace",
            TraceModule::Install => "modsync_core::install=trace",
            TraceModule::Net => "modsync_core::net=trace",
            TraceModule::All => "modsync_core=trace",
        };

        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }

    if !trace_modules.is_empty() {
        // stdout carries command output, logs go to stderr
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .init();

        tracing::info!(trace_modules = ?trace_modules, "modsync tracing enabled");
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, &cli.trace);

    let app = App::load(cli.config.as_deref())?;
    match cli.command {
        Command::Repo { command } => command.execute(&app).await,
        Command::Sync { json } => repo_cli::execute_sync(&app, json).await,
        Command::Search { query, json } => repo_cli::execute_search(&app, &query, json).await,
        Command::Local { command } => command.execute(&app).await,
        Command::Install(args) => args.execute(&app).await,
    }
}
