mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Types
// ============================================================================

/// Fabula - desktop client runtime for a locally-hosted story chat backend
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an interactive chat session, spawning the backend if needed
    Chat {
        /// Conversation to chat in
        #[arg(short = 'i', long, default_value = "default")]
        conversation: String,

        /// Path to configuration file
        #[arg(short, long, default_value = "fabula.yaml")]
        config: String,

        /// Connect to a backend already listening on this port instead of spawning one
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show the running backend's health and settings
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "fabula.yaml")]
        config: String,

        /// Backend port (skips discovery)
        #[arg(short, long)]
        port: Option<u16>,

        /// Also show story progress for this conversation
        #[arg(short = 'i', long)]
        conversation: Option<String>,
    },

    /// Ask a running backend to shut down
    Stop {
        /// Path to configuration file
        #[arg(short, long, default_value = "fabula.yaml")]
        config: String,

        /// Backend port (skips discovery)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            conversation,
            config,
            port,
        } => commands::chat::run(&config, &conversation, port).await,
        Commands::Status {
            config,
            port,
            conversation,
        } => commands::status::run(&config, port, conversation.as_deref()).await,
        Commands::Stop { config, port } => commands::stop::run(&config, port).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
