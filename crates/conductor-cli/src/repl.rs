//! Interactive session.
//!
//! One conversation is kept across prompts. Ctrl-C while the model or a
//! tool is running cancels that round only.

use std::path::PathBuf;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio_util::sync::CancellationToken;

use conductor_agent::{AgentError, Orchestrator};

use crate::commands;

/// What a slash command asks the loop to do.
enum CommandResult {
    Continue,
    Exit,
}

/// Run the REPL until `/exit`, EOF, or a tool server failure ends the run.
pub async fn run(orchestrator: &mut Orchestrator) -> anyhow::Result<()> {
    println!(
        "conductor {} | {} tools from {} servers | /tools, /exit",
        env!("CARGO_PKG_VERSION"),
        orchestrator.all_tools().len(),
        orchestrator.servers().len()
    );

    let mut editor = DefaultEditor::new()?;
    let history_path = history_path();
    if history_path.exists() {
        let _ = editor.load_history(&history_path);
    }

    loop {
        match editor.readline(">>> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);

                if line.starts_with('/') {
                    match handle_command(line, orchestrator) {
                        CommandResult::Continue => continue,
                        CommandResult::Exit => break,
                    }
                }

                if let Err(e) = run_round(orchestrator, line).await {
                    eprintln!("\nError: {}", e);
                }
                if let Some(cause) = orchestrator.root().cause() {
                    eprintln!("Tool servers stopped: {}", cause);
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(parent) = history_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = editor.save_history(&history_path);

    Ok(())
}

/// Run a single prompt and return.
pub async fn run_once(orchestrator: &mut Orchestrator, prompt: &str) -> anyhow::Result<()> {
    run_round(orchestrator, prompt).await?;
    Ok(())
}

async fn run_round(orchestrator: &mut Orchestrator, prompt: &str) -> Result<(), AgentError> {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = orchestrator.run_with_cancel(prompt, &cancel).await;
    interrupt.abort();
    println!();

    match result {
        Ok(_) => Ok(()),
        Err(AgentError::Cancelled) if cancel.is_cancelled() => {
            eprintln!("[Cancelled]");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn handle_command(line: &str, orchestrator: &Orchestrator) -> CommandResult {
    let command = line.split_whitespace().next().unwrap_or_default();
    match command {
        "/exit" | "/quit" => CommandResult::Exit,
        "/tools" => {
            commands::print_catalog(orchestrator);
            CommandResult::Continue
        }
        other => {
            eprintln!("Unknown command: {} (try /tools or /exit)", other);
            CommandResult::Continue
        }
    }
}

fn history_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conductor")
        .join("history.txt")
}
