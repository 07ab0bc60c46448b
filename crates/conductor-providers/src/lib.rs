//! # conductor-providers
//!
//! Streaming language model backends for Conductor.
//!
//! This crate provides:
//! - The [`ModelBackend`] trait the orchestrator drives
//! - An Anthropic Messages API backend with SSE streaming
//! - A line-buffered SSE parser

pub mod anthropic;
pub mod sse;
pub mod traits;

pub use anthropic::AnthropicBackend;
pub use traits::{EventStream, ModelBackend, ModelMessage, ModelRequest, StopReason, StreamEvent};

use conductor_core::config::ModelConfig;
use std::sync::Arc;

/// Build the backend named by `config.provider`.
pub fn from_config(config: &ModelConfig) -> anyhow::Result<Arc<dyn ModelBackend>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicBackend::from_config(config)?)),
        other => anyhow::bail!("unknown model provider: {}", other),
    }
}
