//! Turnstile CLI, the main entry point.
//!
//! Commands:
//! - `init`: Write a default config
//! - `run`: Run one agent on a task
//! - `multi`: Run a team of agents from a profile file
//! - `tools`: List the tools the agent would see
//! - `config`: Show the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod console;
mod setup;

#[derive(Parser)]
#[command(
    name = "turnstile",
    about = "Turnstile — turn-based agent execution core",
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
    /// Write ~/.turnstile/config.toml with defaults
    Init,

    /// Run a single agent
    Run {
        /// The task. Asked for interactively when omitted.
        task: Option<String>,

        /// Files handed to the model with the first turn
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// Ask before every action
        #[arg(long)]
        confirm: bool,
    },

    /// Run a team of agents that message each other
    Multi {
        /// Agent profiles (.toml, .yaml or .yml)
        profiles: PathBuf,

        /// The task for the main agent. Asked for interactively when omitted.
        task: Option<String>,
    },

    /// List available tools
    Tools,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command {
        Commands::Init => commands::init::run().await?,
        Commands::Run {
            task,
            files,
            confirm,
        } => commands::run::run(task, files, confirm).await?,
        Commands::Multi { profiles, task } => commands::multi::run(profiles, task).await?,
        Commands::Tools => commands::tools::run().await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
