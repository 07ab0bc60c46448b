//! Model backend trait definitions.

use std::pin::Pin;

use async_trait::async_trait;
use conductor_core::{ContentBlock, ToolDescriptor, Turn};
use futures::Stream;
use serde::{Deserialize, Serialize};

/// Request for one streamed model response.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Model to use
    pub model: String,
    /// Full conversation so far
    pub turns: Vec<Turn>,
    /// System prompt
    pub system: Option<String>,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Tools the model may invoke
    pub tools: Vec<ToolDescriptor>,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Normal completion
    EndTurn,
    /// The model wants tool results before it continues
    ToolUse,
    /// Hit max tokens limit
    MaxTokens,
}

/// The final structured message of one model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMessage {
    /// Text and tool invocation blocks, in order
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl ModelMessage {
    /// Whether any block asks for a tool.
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// One item of a model response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text
    TextDelta(String),
    /// The assembled message; always the last item
    Completed(ModelMessage),
}

/// Boxed response stream.
pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// A streaming language model.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend identifier.
    fn id(&self) -> &str;

    /// Start a streamed response. Text deltas come first, then exactly one
    /// [`StreamEvent::Completed`].
    async fn stream(&self, request: ModelRequest) -> anyhow::Result<EventStream>;
}
