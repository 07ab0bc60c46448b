//! # conductor-cli
//!
//! Command-line interface for Conductor.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use conductor_agent::{ConversationStore, Orchestrator, OrchestratorBuilder};
use conductor_core::error::format_error_with_suggestion;
use conductor_core::Config;
use conductor_mcp::Scope;

mod commands;
mod handlers;
mod repl;

use handlers::CliEventHandler;

/// Conductor - drive a language model with tools from external tool servers
#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Prompt to run once; without one an interactive session starts
    #[arg(value_name = "PROMPT")]
    prompt: Vec<String>,

    /// Model to use, overriding the configuration
    #[arg(short, long)]
    model: Option<String>,

    /// Configuration file layered over the defaults
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Continue the saved conversation
    #[arg(long = "continue")]
    continue_conversation: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured tool servers and list their tools
    Tools,
    /// Print the resolved configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries model output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = Config::load_validated(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!(format_error_with_suggestion(&e)))?;
    if let Some(model) = &cli.model {
        config.model.model = model.clone();
    }

    match cli.command {
        Some(Commands::Tools) => commands::list_tools(&config).await,
        Some(Commands::Config) => commands::show_config(&config),
        None => {
            let root = Scope::root();
            let mut orchestrator = start_orchestrator(&config, cli.continue_conversation, &root).await?;

            let outcome = if cli.prompt.is_empty() {
                repl::run(&mut orchestrator).await
            } else {
                repl::run_once(&mut orchestrator, &cli.prompt.join(" ")).await
            };

            orchestrator.shutdown().await;
            outcome
        }
    }
}

async fn start_orchestrator(
    config: &Config,
    resume: bool,
    root: &Scope,
) -> anyhow::Result<Orchestrator> {
    let backend = conductor_providers::from_config(&config.model)?;

    let mut builder = OrchestratorBuilder::from_config(config)
        .backend(backend)
        .root(root.clone())
        .event_handler(Arc::new(CliEventHandler::new()));

    if resume {
        let store = ConversationStore::new(config.session.conversation_path());
        if let Some(conversation) = store.load().await? {
            eprintln!("[Continuing conversation: {} turns]", conversation.len());
            builder = builder.conversation(conversation);
        }
    }

    Ok(builder.start().await?)
}
