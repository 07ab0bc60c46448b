//! Terminal event handler.
//!
//! Text deltas go to stdout as they arrive; tool activity is announced on
//! stderr so piped output stays clean.

use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Instant;

use conductor_agent::AgentEventHandler;
use conductor_mcp::{Message, ToolOutput};
use serde_json::Value;

/// Longest tool output shown in an announcement.
const PREVIEW_CHARS: usize = 200;

pub struct CliEventHandler {
    /// When the running tool started
    tool_start: Mutex<Option<Instant>>,
}

impl CliEventHandler {
    pub fn new() -> Self {
        Self {
            tool_start: Mutex::new(None),
        }
    }
}

impl Default for CliEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentEventHandler for CliEventHandler {
    fn on_text_delta(&self, delta: &str) {
        print!("{}", delta);
        io::stdout().flush().ok();
    }

    fn on_tool_start(&self, name: &str, input: &Value) {
        if let Ok(mut start) = self.tool_start.lock() {
            *start = Some(Instant::now());
        }
        eprintln!("\n[Tool: {}] {}", name, input);
    }

    fn on_tool_complete(&self, name: &str, output: &ToolOutput) {
        let elapsed = self
            .tool_start
            .lock()
            .ok()
            .and_then(|mut start| start.take())
            .map(|start| start.elapsed().as_millis())
            .unwrap_or_default();

        let status = if output.is_error { "FAILED" } else { "OK" };
        eprintln!("[Tool: {}] {} ({}ms)", name, status, elapsed);
        if output.is_error {
            eprintln!("[Error: {}]", preview(&output.content));
        } else {
            tracing::debug!(tool = %name, output = %preview(&output.content), "Tool output");
        }
    }

    fn on_notification(&self, server: &str, message: &Message) {
        if let Some(method) = &message.method {
            eprintln!("[{}: {}]", server, method);
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", cut)
}
