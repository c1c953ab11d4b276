mod config;
mod init_cmd;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drover", about = "Drives LLM coding agents through tracker issues")]
struct Cli {
    /// Config file path (overrides the CONFIG_PATH env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the orchestrator until interrupted
    Run,
    /// Show the persisted scheduler state (active agents, spend, queue)
    Status,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Commands::Init { force } => init_cmd::run_init(&config_path, force),
        Commands::Run => run_cmd::run_orchestrator(&config_path).await,
        Commands::Status => status_cmd::run_status(),
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "drover",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}
