//! Press agent - per-host job workers and proxy reload coordinator

use clap::Parser;
use press_agent::cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli.run().await {
        tracing::error!(error = %format!("{e:#}"), "press-agent failed");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
