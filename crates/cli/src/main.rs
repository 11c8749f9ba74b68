//! chatloop CLI — the main entry point.
//!
//! Commands:
//! - `chat`    — Run one exchange and stream the answer
//! - `config`  — Show, initialize or locate the configuration

use clap::{Parser, Subcommand};

mod commands;
mod tools;

#[derive(Parser)]
#[command(
    name = "chatloop",
    about = "chatloop — streaming LLM chat with a bounded tool loop",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and stream the response
    Chat {
        /// The message to send
        #[arg(short, long)]
        message: String,

        /// Print reasoning text to stderr as it streams
        #[arg(long)]
        show_reasoning: bool,

        /// Override the tool-loop attempt cap
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (API key redacted)
    Show,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only the answer
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat {
            message,
            show_reasoning,
            max_attempts,
        } => commands::chat::run(message, show_reasoning, max_attempts).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Init { force } => commands::config_cmd::init(force).await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
    }

    Ok(())
}
