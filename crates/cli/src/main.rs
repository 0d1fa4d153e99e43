use anyhow::Result;
use clap::{Parser, Subcommand};
use common::{init_structured_logging, LoggingConfig};
use std::path::PathBuf;

mod commands;
mod services;

use commands::{ChatCommand, CohortCommand, ConfigCommand, ExtractCommand, PhasesCommand};

#[derive(Parser)]
#[command(name = "scholar")]
#[command(about = "Academic writing assistant backend")]
#[command(version)]
struct Cli {
    /// Model configuration file (TOML)
    #[arg(long, global = true, env = "SCHOLAR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream one assistant reply as JSON-line events
    Chat(ChatCommand),
    /// Extract workflow state from a saved reply
    Extract(ExtractCommand),
    /// Show the cohort bucket of a user
    Cohort(CohortCommand),
    /// List the workflow phases
    Phases(PhasesCommand),
    /// Inspect the active model configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_structured_logging(LoggingConfig::from_env())?;

    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command {
        Commands::Chat(cmd) => cmd.execute(config_path).await,
        Commands::Extract(cmd) => cmd.execute(),
        Commands::Cohort(cmd) => cmd.execute(),
        Commands::Phases(cmd) => cmd.execute(),
        Commands::Config(cmd) => cmd.execute(config_path).await,
    }
}
