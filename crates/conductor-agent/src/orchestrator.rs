//! The tool-use loop.
//!
//! An [`Orchestrator`] owns the running tool servers, merges their catalogs,
//! and alternates between streaming a model response and dispatching the
//! tool invocations it asks for until the model stops asking.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, OnceLock};

use conductor_core::config::{Config, ServerConfig};
use conductor_core::{ContentBlock, Conversation, ToolDescriptor, Turn};
use conductor_mcp::transport::from_config as server_from_config;
use conductor_mcp::{McpError, Message, RpcConfig, Scope, ServerHandle, ToolOutput, ToolServer};
use conductor_providers::{ModelBackend, ModelMessage, ModelRequest, StopReason, StreamEvent};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::ConversationStore;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that end a round.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Error from the model backend.
    #[error("Model error: {0}")]
    Model(#[from] anyhow::Error),

    /// The model stream ended without a final message.
    #[error("Model stream ended without a final message")]
    IncompleteResponse,

    /// No running server offers the requested tool.
    #[error("No tool server offers '{0}'")]
    UnknownTool(String),

    /// Tool input was not a JSON object.
    #[error("Tool '{name}' input is not an object: {input}")]
    InvalidToolInput { name: String, input: Value },

    /// The call itself failed (timeout, closed connection, ...).
    #[error("Tool '{name}' failed: {source}")]
    ToolCall {
        name: String,
        #[source]
        source: McpError,
    },

    /// Too many model calls in one run.
    #[error("Maximum rounds exceeded: {0}")]
    MaxRoundsExceeded(usize),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Snapshot could not be written.
    #[error("Persistence error: {0}")]
    Persistence(#[from] conductor_core::Error),

    /// Missing builder input.
    #[error("Not configured: {0}")]
    NotConfigured(String),
}

/// Result type for orchestrator operations.
pub type AgentResult<T> = Result<T, AgentError>;

// ============================================================================
// Configuration
// ============================================================================

/// Loop settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    /// Model calls allowed per run.
    pub max_rounds: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl AgentConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.model.clone(),
            max_tokens: config.model.max_tokens,
            system_prompt: config.model.system_prompt.clone(),
            max_rounds: config.session.max_rounds,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }
}

// ============================================================================
// Events
// ============================================================================

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// Text of the final assistant turn
    pub content: String,
    pub stop_reason: StopReason,
    /// Number of model calls made
    pub model_calls: usize,
}

/// Observer for loop progress. All methods default to doing nothing.
pub trait AgentEventHandler: Send + Sync {
    /// Called before each model call.
    fn on_thinking(&self) {}

    /// Called for each streamed piece of text.
    fn on_text_delta(&self, _delta: &str) {}

    /// Called before a tool is invoked.
    fn on_tool_start(&self, _name: &str, _input: &Value) {}

    /// Called after a tool returned, including error output.
    fn on_tool_complete(&self, _name: &str, _output: &ToolOutput) {}

    /// Called when a run finishes normally.
    fn on_complete(&self, _response: &AgentResponse) {}

    /// Called for notifications on the configured routes.
    fn on_notification(&self, _server: &str, _message: &Message) {}
}

/// No-op event handler.
pub struct NoOpEventHandler;

impl AgentEventHandler for NoOpEventHandler {}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives a conversation against a model backend and a set of tool servers.
pub struct Orchestrator {
    servers: Vec<ServerHandle>,
    backend: Arc<dyn ModelBackend>,
    config: AgentConfig,
    conversation: Conversation,
    catalog: OnceLock<Vec<ToolDescriptor>>,
    root: Scope,
    store: Option<ConversationStore>,
    events: Arc<dyn AgentEventHandler>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Every tool of every server, in registration order.
    ///
    /// Computed on first use and kept for the orchestrator's life. Names
    /// offered by more than one server are logged; the first server wins.
    pub fn all_tools(&self) -> &[ToolDescriptor] {
        self.catalog.get_or_init(|| {
            let mut owners: HashMap<&str, &str> = HashMap::new();
            let mut tools = Vec::new();
            for server in &self.servers {
                for tool in server.client().tools() {
                    match owners.get(tool.name.as_str()) {
                        Some(owner) => warn!(
                            tool = %tool.name,
                            owner = %owner,
                            shadowed = %server.name(),
                            "Tool name collision, first registered server wins"
                        ),
                        None => {
                            owners.insert(&tool.name, server.name());
                        }
                    }
                    tools.push(tool.clone());
                }
            }
            tools
        })
    }

    /// The server that owns `name`: the first one offering it.
    pub fn client_for_tool(&self, name: &str) -> Option<&ServerHandle> {
        self.servers.iter().find(|s| s.client().has_tool(name))
    }

    /// Running servers, in registration order.
    pub fn servers(&self) -> &[ServerHandle] {
        &self.servers
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The scope every server runs under.
    pub fn root(&self) -> &Scope {
        &self.root
    }

    /// Run one user prompt to completion.
    pub async fn run(&mut self, prompt: &str) -> AgentResult<AgentResponse> {
        self.run_with_cancel(prompt, &CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but `cancel` also ends the round. Cancelling
    /// it leaves the servers running.
    pub async fn run_with_cancel(
        &mut self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> AgentResult<AgentResponse> {
        self.conversation.push(Turn::user(prompt));
        let max_rounds = self.config.max_rounds.max(1);

        for round in 0..max_rounds {
            debug!(round, "Requesting model response");
            self.events.on_thinking();

            let message = self.await_model(cancel).await?;
            let stop_reason = message.stop_reason;
            let wants_tools = stop_reason == StopReason::ToolUse && message.has_tool_use();
            let assistant = Turn::assistant(message.content);

            if !wants_tools {
                let response = AgentResponse {
                    content: assistant.text(),
                    stop_reason,
                    model_calls: round + 1,
                };
                self.conversation.push(assistant);
                self.persist().await?;
                self.events.on_complete(&response);
                return Ok(response);
            }

            if round + 1 >= max_rounds {
                warn!(max_rounds, "Max rounds exceeded");
                break;
            }

            // A tool_use turn only enters the conversation with its results.
            let results = self.dispatch_tools(&assistant, cancel).await?;
            self.conversation.push(assistant);
            self.conversation.push(Turn::tool_results(results));
            self.persist().await?;
        }

        Err(AgentError::MaxRoundsExceeded(max_rounds))
    }

    /// Invoke every tool `turn` asks for, in order.
    ///
    /// Either every invocation produces a result block or the first failure
    /// is returned and nothing is produced.
    pub async fn dispatch_tools(
        &self,
        turn: &Turn,
        cancel: &CancellationToken,
    ) -> AgentResult<Vec<ContentBlock>> {
        let mut results = Vec::new();

        for (id, name, input) in turn.tool_uses() {
            let server = self
                .client_for_tool(name)
                .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;
            let arguments = match input {
                Value::Object(map) => map.clone(),
                other => {
                    return Err(AgentError::InvalidToolInput {
                        name: name.to_string(),
                        input: other.clone(),
                    })
                }
            };

            info!(tool = %name, server = %server.name(), "Calling tool");
            self.events.on_tool_start(name, input);

            let output = guarded(&self.root, cancel, server.client().call_tool(name, arguments))
                .await?
                .map_err(|source| AgentError::ToolCall {
                    name: name.to_string(),
                    source,
                })?;

            self.events.on_tool_complete(name, &output);
            results.push(ContentBlock::tool_result(id, output.content, output.is_error));
        }

        Ok(results)
    }

    /// Shut every server down and wait for their watchers.
    pub async fn shutdown(self) {
        for server in self.servers {
            let name = server.name().to_string();
            server.shutdown().await;
            debug!(server = %name, "Tool server stopped");
        }
    }

    async fn await_model(&self, cancel: &CancellationToken) -> AgentResult<ModelMessage> {
        let request = ModelRequest {
            model: self.config.model.clone(),
            turns: self.conversation.turns().to_vec(),
            system: self.config.system_prompt.clone(),
            max_tokens: self.config.max_tokens,
            tools: self.model_tools(),
        };

        let mut stream = guarded(&self.root, cancel, self.backend.stream(request)).await??;
        loop {
            match guarded(&self.root, cancel, stream.next()).await? {
                Some(Ok(StreamEvent::TextDelta(delta))) => self.events.on_text_delta(&delta),
                Some(Ok(StreamEvent::Completed(message))) => return Ok(message),
                Some(Err(e)) => return Err(AgentError::Model(e)),
                None => return Err(AgentError::IncompleteResponse),
            }
        }
    }

    /// The catalog as sent to the model: shadowed names are left out.
    fn model_tools(&self) -> Vec<ToolDescriptor> {
        let mut seen = HashSet::new();
        self.all_tools()
            .iter()
            .filter(|tool| seen.insert(tool.name.as_str()))
            .cloned()
            .collect()
    }

    async fn persist(&self) -> AgentResult<()> {
        if let Some(store) = &self.store {
            store.save(&self.conversation).await?;
        }
        Ok(())
    }
}

/// Run `fut` unless the root scope or the round is cancelled first.
async fn guarded<F: Future>(
    root: &Scope,
    cancel: &CancellationToken,
    fut: F,
) -> AgentResult<F::Output> {
    tokio::select! {
        biased;
        _ = root.cancelled() => Err(AgentError::Cancelled),
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        out = fut => Ok(out),
    }
}

fn forward_notifications(
    server: String,
    method: String,
    mut rx: mpsc::Receiver<Message>,
    events: Arc<dyn AgentEventHandler>,
) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            debug!(server = %server, method = %method, "Server notification");
            events.on_notification(&server, &message);
        }
    });
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for creating an orchestrator.
pub struct OrchestratorBuilder {
    servers: Vec<Box<dyn ToolServer>>,
    rpc: RpcConfig,
    backend: Option<Arc<dyn ModelBackend>>,
    config: AgentConfig,
    root: Option<Scope>,
    store: Option<ConversationStore>,
    events: Option<Arc<dyn AgentEventHandler>>,
    conversation: Conversation,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            rpc: RpcConfig::default(),
            backend: None,
            config: AgentConfig::default(),
            root: None,
            store: None,
            events: None,
            conversation: Conversation::new(),
        }
    }

    /// Take servers, protocol settings, loop settings and persistence from
    /// a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new()
            .rpc_config(RpcConfig::from(&config.rpc))
            .config(AgentConfig::from_config(config))
            .servers_from_config(config.enabled_servers());
        if config.session.persist {
            builder = builder.store(ConversationStore::new(config.session.conversation_path()));
        }
        builder
    }

    /// Add a tool server. Registration order decides tool ownership.
    pub fn server(mut self, server: impl ToolServer + 'static) -> Self {
        self.servers.push(Box::new(server));
        self
    }

    /// Add servers from config entries. Entries that cannot be built are
    /// logged and skipped.
    pub fn servers_from_config<'a>(mut self, entries: impl IntoIterator<Item = &'a ServerConfig>) -> Self {
        for entry in entries {
            match server_from_config(entry) {
                Ok(server) => self.servers.push(server),
                Err(e) => error!(server = %entry.name, error = %e, "Invalid tool server entry"),
            }
        }
        self
    }

    pub fn rpc_config(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Scope the servers run under. Defaults to a fresh root.
    pub fn root(mut self, root: Scope) -> Self {
        self.root = Some(root);
        self
    }

    pub fn store(mut self, store: ConversationStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_handler(mut self, events: Arc<dyn AgentEventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Continue an earlier conversation.
    pub fn conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = conversation;
        self
    }

    /// Start every server and run its handshake.
    ///
    /// A server that fails to open or to complete the handshake is logged
    /// and left out; the others still start.
    pub async fn start(self) -> AgentResult<Orchestrator> {
        let backend = self
            .backend
            .ok_or_else(|| AgentError::NotConfigured("model backend is required".into()))?;
        let root = self.root.unwrap_or_else(Scope::root);
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(NoOpEventHandler));

        let mut servers = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            match ServerHandle::start(server.as_ref(), self.rpc.clone(), &root).await {
                Ok(mut handle) => {
                    for method in &self.rpc.notification_routes {
                        if let Some(rx) = handle.take_listener(method) {
                            forward_notifications(
                                handle.name().to_string(),
                                method.clone(),
                                rx,
                                events.clone(),
                            );
                        }
                    }
                    servers.push(handle);
                }
                Err(e) => {
                    error!(server = %server.name(), error = %e, "Skipping tool server");
                }
            }
        }

        info!(
            servers = servers.len(),
            configured = self.servers.len(),
            backend = backend.id(),
            "Orchestrator started"
        );

        Ok(Orchestrator {
            servers,
            backend,
            config: self.config,
            conversation: self.conversation,
            catalog: OnceLock::new(),
            root,
            store: self.store,
            events,
        })
    }
}
