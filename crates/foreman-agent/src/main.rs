use clap::Parser;
use tracing_subscriber::EnvFilter;

use foreman_types::AgentConfig;

/// Foreman worker agent -- fetches, executes, and reports commands.
#[derive(Parser, Debug)]
#[command(name = "foreman-agent", version, about)]
struct Cli {
    /// Increase logging verbosity (RUST_LOG=debug)
    #[arg(long, short)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, short)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AgentConfig::from_env()?;
    foreman_agent::runner::run(config).await
}
