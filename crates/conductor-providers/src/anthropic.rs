//! Anthropic (Claude) streaming backend.

use std::collections::VecDeque;
use std::fmt::Display;

use async_trait::async_trait;
use conductor_core::config::ModelConfig;
use conductor_core::{ContentBlock, ToolDescriptor, Turn};
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::sse::SseParser;
use crate::traits::{EventStream, ModelBackend, ModelMessage, ModelRequest, StopReason, StreamEvent};

/// Anthropic API base URL.
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";

/// Current Anthropic API version.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic backend for Claude models.
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicBackend {
    /// Create a new Anthropic backend.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// Build from the model section of the configuration.
    pub fn from_config(config: &ModelConfig) -> anyhow::Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            anyhow::anyhow!(
                "no API key configured; set {} or model.api_key",
                config.api_key_env
            )
        })?;
        let mut backend = Self::new(api_key);
        if let Some(url) = &config.base_url {
            backend = backend.with_base_url(url.trim_end_matches('/'));
        }
        Ok(backend)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn build_request<'a>(&self, request: &'a ModelRequest) -> AnthropicRequest<'a> {
        AnthropicRequest {
            model: &request.model,
            messages: &request.turns,
            system: request.system.as_deref(),
            max_tokens: request.max_tokens,
            tools: request.tools.iter().map(AnthropicTool::from).collect(),
            stream: true,
        }
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn id(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, request), fields(model = %request.model, turns = request.turns.len()))]
    async fn stream(&self, request: ModelRequest) -> anyhow::Result<EventStream> {
        let api_request = self.build_request(&request);

        debug!("Sending streaming request to Anthropic API");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Anthropic API error: {} - {}", status, error_text);
            anyhow::bail!("Anthropic API error: {} - {}", status, error_text);
        }

        Ok(event_stream(Box::pin(response.bytes_stream())))
    }
}

struct StreamState<S> {
    bytes: S,
    parser: SseParser,
    assembler: MessageAssembler,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

/// Turn a raw SSE byte stream into text deltas followed by the assembled
/// message.
pub(crate) fn event_stream<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = StreamState {
        bytes,
        parser: SseParser::new(),
        assembler: MessageAssembler::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    let events = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for sse in state.parser.feed(chunk.as_ref()) {
                        match state.assembler.apply(&sse.data) {
                            Ok(events) => state.pending.extend(events),
                            Err(e) => {
                                state.finished = true;
                                return Some((Err(e), state));
                            }
                        }
                    }
                    if state.assembler.is_complete() {
                        state.finished = true;
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(anyhow::anyhow!("Stream error: {}", e)), state));
                }
                None => {
                    state.finished = true;
                    if !state.assembler.is_complete() {
                        return Some((
                            Err(anyhow::anyhow!("stream ended before message_stop")),
                            state,
                        ));
                    }
                }
            }
        }
    });

    Box::pin(events)
}

enum BlockBuilder {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Folds Anthropic stream events into one [`ModelMessage`].
#[derive(Default)]
pub(crate) struct MessageAssembler {
    blocks: Vec<(usize, BlockBuilder)>,
    content: Vec<(usize, ContentBlock)>,
    stop_reason: Option<StopReason>,
    complete: bool,
}

impl MessageAssembler {
    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    /// Apply one SSE data payload and return the events it produces.
    pub(crate) fn apply(&mut self, data: &str) -> anyhow::Result<Vec<StreamEvent>> {
        let event: AnthropicEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to parse SSE event: {}", e);
                return Ok(Vec::new());
            }
        };

        match event {
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StartBlock::Text { text } => {
                    let events = if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![StreamEvent::TextDelta(text.clone())]
                    };
                    self.blocks.push((index, BlockBuilder::Text(text)));
                    Ok(events)
                }
                StartBlock::ToolUse { id, name } => {
                    self.blocks.push((
                        index,
                        BlockBuilder::ToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                    ));
                    Ok(Vec::new())
                }
                StartBlock::Other => Ok(Vec::new()),
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => {
                let Some((_, block)) = self.blocks.iter_mut().find(|(i, _)| *i == index) else {
                    return Ok(Vec::new());
                };
                match (block, delta) {
                    (BlockBuilder::Text(text), Delta::TextDelta { text: piece }) => {
                        text.push_str(&piece);
                        Ok(vec![StreamEvent::TextDelta(piece)])
                    }
                    (BlockBuilder::ToolUse { json, .. }, Delta::InputJsonDelta { partial_json }) => {
                        json.push_str(&partial_json);
                        Ok(Vec::new())
                    }
                    _ => Ok(Vec::new()),
                }
            }
            AnthropicEvent::ContentBlockStop { index } => {
                let Some(pos) = self.blocks.iter().position(|(i, _)| *i == index) else {
                    return Ok(Vec::new());
                };
                let (index, block) = self.blocks.remove(pos);
                let block = match block {
                    BlockBuilder::Text(text) => ContentBlock::Text { text },
                    BlockBuilder::ToolUse { id, name, json } => {
                        let input = if json.trim().is_empty() {
                            serde_json::Value::Object(Default::default())
                        } else {
                            serde_json::from_str(&json).map_err(|e| {
                                anyhow::anyhow!("invalid tool input JSON for {}: {}", name, e)
                            })?
                        };
                        ContentBlock::ToolUse { id, name, input }
                    }
                };
                self.content.push((index, block));
                Ok(Vec::new())
            }
            AnthropicEvent::MessageDelta { delta } => {
                if let Some(reason) = delta.and_then(|d| d.stop_reason) {
                    self.stop_reason = Some(map_stop_reason(&reason));
                }
                Ok(Vec::new())
            }
            AnthropicEvent::MessageStop => {
                self.complete = true;
                let mut content = std::mem::take(&mut self.content);
                content.sort_by_key(|(index, _)| *index);
                Ok(vec![StreamEvent::Completed(ModelMessage {
                    content: content.into_iter().map(|(_, block)| block).collect(),
                    stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                })])
            }
            AnthropicEvent::Error { error } => {
                Err(anyhow::anyhow!("Anthropic stream error: {}", error))
            }
            AnthropicEvent::MessageStart | AnthropicEvent::Ping | AnthropicEvent::Unknown => {
                Ok(Vec::new())
            }
        }
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "end_turn" | "stop_sequence" => StopReason::EndTurn,
        other => {
            debug!(reason = other, "Unrecognized stop reason, treating as end_turn");
            StopReason::EndTurn
        }
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    input_schema: &'a serde_json::Value,
}

impl<'a> From<&'a ToolDescriptor> for AnthropicTool<'a> {
    fn from(tool: &'a ToolDescriptor) -> Self {
        Self {
            name: &tool.name,
            description: tool.description.as_deref(),
            input_schema: &tool.input_schema,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "message_start")]
    MessageStart,
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: usize, content_block: StartBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: Option<MessageDeltaBody> },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: serde_json::Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StartBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sse(events: &[serde_json::Value]) -> String {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
            .collect()
    }

    fn tool_use_transcript() -> String {
        sse(&[
            json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 10}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Let me "}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "check."}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "echo", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"text\":"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": " \"hi\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 20}}),
            json!({"type": "message_stop"}),
        ])
    }

    async fn collect(chunks: Vec<Vec<u8>>) -> Vec<anyhow::Result<StreamEvent>> {
        let bytes = stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        event_stream(bytes).collect().await
    }

    #[tokio::test]
    async fn test_tool_use_message_is_assembled() {
        let transcript = tool_use_transcript().into_bytes();
        // Split at an awkward point to exercise buffering.
        let (a, b) = transcript.split_at(transcript.len() / 3);
        let events = collect(vec![a.to_vec(), b.to_vec()]).await;
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();

        assert_eq!(events[0], StreamEvent::TextDelta("Let me ".to_string()));
        assert_eq!(events[1], StreamEvent::TextDelta("check.".to_string()));
        match &events[2] {
            StreamEvent::Completed(message) => {
                assert_eq!(message.stop_reason, StopReason::ToolUse);
                assert_eq!(message.content[0], ContentBlock::text("Let me check."));
                assert_eq!(
                    message.content[1],
                    ContentBlock::ToolUse {
                        id: "toolu_1".to_string(),
                        name: "echo".to_string(),
                        input: json!({"text": "hi"}),
                    }
                );
                assert!(message.has_tool_use());
            }
            other => panic!("expected Completed, got {:?}", other),
        }
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let transcript = sse(&[
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
        ]);
        let events = collect(vec![transcript.into_bytes()]).await;
        assert!(events[0].is_ok());
        assert!(events.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn test_error_event_fails_stream() {
        let transcript = sse(&[json!({"type": "error", "error": {"type": "overloaded_error"}})]);
        let events = collect(vec![transcript.into_bytes()]).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason("tool_use"), StopReason::ToolUse);
        assert_eq!(map_stop_reason("end_turn"), StopReason::EndTurn);
        assert_eq!(map_stop_reason("stop_sequence"), StopReason::EndTurn);
        assert_eq!(map_stop_reason("max_tokens"), StopReason::MaxTokens);
    }

    #[test]
    fn test_request_body_shape() {
        let backend = AnthropicBackend::new("test-key");
        let request = ModelRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            turns: vec![Turn::user("Hello")],
            system: None,
            max_tokens: 1024,
            tools: vec![ToolDescriptor::new("echo").with_description("Echo text")],
        };

        let body = serde_json::to_value(backend.build_request(&request)).unwrap();
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(body["tools"][0]["name"], "echo");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["stream"], true);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = ModelConfig {
            api_key: None,
            api_key_env: "CONDUCTOR_TEST_UNSET_KEY".to_string(),
            ..Default::default()
        };
        assert!(AnthropicBackend::from_config(&config).is_err());

        let config = ModelConfig {
            api_key: Some("k".to_string()),
            base_url: Some("http://localhost:8080/v1/".to_string()),
            ..Default::default()
        };
        let backend = AnthropicBackend::from_config(&config).unwrap();
        assert_eq!(backend.base_url, "http://localhost:8080/v1");
    }
}
