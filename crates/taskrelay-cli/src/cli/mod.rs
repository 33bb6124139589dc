//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use taskrelay_core::config::paths;
use taskrelay_core::job::JobKind;

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "taskrelay")]
#[command(version)]
#[command(about = "Turns ntfy notifications into coding-agent jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Subscribe to the ntfy topic and run incoming jobs
    Daemon,
    /// Inspect the job ledger
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum JobsCommands {
    /// Lists jobs, newest first
    List {
        /// Only show jobs of this kind (auto, interactive)
        #[arg(long, value_name = "KIND")]
        kind: Option<JobKind>,
    },
    /// Shows a job with its result and steps
    Show {
        /// The ID of the job to show
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Print the effective configuration (file plus environment)
    Show,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => {
            let _guard = logging::init_with_file(&paths::logs_dir())?;
            // one tokio runtime for the daemon
            let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
            rt.block_on(commands::daemon::run())
        }
        Commands::Jobs { command } => {
            logging::init_stderr();
            match command {
                JobsCommands::List { kind } => commands::jobs::list(kind),
                JobsCommands::Show { id } => commands::jobs::show(&id),
            }
        }
        Commands::Config { command } => {
            logging::init_stderr();
            match command {
                ConfigCommands::Path => {
                    commands::config::path();
                    Ok(())
                }
                ConfigCommands::Show => commands::config::show(),
                ConfigCommands::Init => commands::config::init(),
            }
        }
    }
}
