//! CLI argument parsing with clap derive

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::app::{AppContext, Overrides};
use crate::commands;
use crate::shutdown::install_shutdown_handler;

/// Per-host job workers and proxy reload coordinator
#[derive(Parser)]
#[command(
    name = "press-agent",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Valkey URL (overrides PRESS_AGENT_VALKEY_URL)
    #[arg(long, global = true)]
    pub valkey_url: Option<String>,

    /// Bench directory (overrides PRESS_AGENT_BENCH_DIRECTORY)
    #[arg(long, global = true)]
    pub bench_dir: Option<String>,

    /// nginx directory (overrides PRESS_AGENT_NGINX_DIRECTORY)
    #[arg(long, global = true)]
    pub nginx_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a job worker until shutdown
    Worker,

    /// Run the proxy reload coordinator until shutdown
    Reload,

    /// Submit a job
    Enqueue(commands::enqueue::EnqueueArgs),

    /// Print a job's status record
    Status(commands::status::StatusArgs),

    /// Cancel a job that has not started yet
    Cancel(commands::cancel::CancelArgs),

    /// Requeue jobs abandoned by dead workers
    Sweep,

    /// Print the rendered proxy configuration
    Render,

    /// Print the reload coordinator report
    Coordinator,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid or the command fails.
    pub async fn run(self) -> Result<()> {
        let Cli {
            valkey_url,
            bench_dir,
            nginx_dir,
            command,
        } = self;
        let app = AppContext::new(Overrides {
            valkey_url,
            bench_directory: bench_dir,
            nginx_directory: nginx_dir,
        })?;

        match command {
            Command::Worker => {
                let shutdown = install_shutdown_handler()?;
                commands::worker::run(&app, &shutdown).await
            }
            Command::Reload => {
                let shutdown = install_shutdown_handler()?;
                commands::reload::run(&app, &shutdown).await
            }
            Command::Enqueue(args) => commands::enqueue::run(&app, &args).await,
            Command::Status(args) => commands::status::run(&app, &args).await,
            Command::Cancel(args) => commands::cancel::run(&app, &args).await,
            Command::Sweep => commands::sweep::run(&app).await,
            Command::Render => commands::render::run(&app),
            Command::Coordinator => commands::coordinator::run(&app).await,
        }
    }
}
