//! Handshake and tool client.
//!
//! [`McpClient`] walks a linear state machine on top of an [`RpcClient`]:
//! `initialize`, then the `notifications/initialized` notification, then one
//! `tools/list`. Only a client that reached [`ClientState::Ready`] is handed
//! out by [`McpClient::initialize`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use conductor_core::ToolDescriptor;

use crate::error::McpError;
use crate::protocol::{
    methods, CallToolParams, InitializeParams, InitializeResult, ListToolsResult, Message,
    ServerInfo,
};
use crate::rpc::RpcClient;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No `initialize` exchange yet.
    Uninitialized,
    /// `initialize` succeeded and the server was notified.
    Initialized,
    /// Tools are known; the client accepts tool calls.
    Ready,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initialized => write!(f, "initialized"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Output of one tool invocation, rendered as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

/// A tool server client that completed the handshake.
pub struct McpClient {
    rpc: RpcClient,
    state: ClientState,
    protocol_version: Option<String>,
    server_info: ServerInfo,
    capabilities: Value,
    tools: Vec<ToolDescriptor>,
}

impl McpClient {
    /// Wrap a protocol client without talking to the server yet.
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            state: ClientState::Uninitialized,
            protocol_version: None,
            server_info: ServerInfo::default(),
            capabilities: Value::Null,
            tools: Vec::new(),
        }
    }

    /// Run the whole handshake and return a ready client.
    pub async fn initialize(rpc: RpcClient) -> Result<Self, McpError> {
        let mut client = Self::new(rpc);
        client.handshake().await?;
        client.discover_tools().await?;
        Ok(client)
    }

    /// `initialize` followed by the `notifications/initialized` notification.
    pub async fn handshake(&mut self) -> Result<(), McpError> {
        self.expect_state(ClientState::Uninitialized)?;

        let params = serde_json::to_value(InitializeParams::default())?;
        let response = self.rpc.call(methods::INITIALIZE, Some(params)).await?;
        let result: InitializeResult = decode_result(response)
            .map_err(|e| McpError::init_failed(e.to_string()))?;

        debug!(
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "Tool server initialized"
        );
        self.protocol_version = Some(result.protocol_version);
        self.server_info = result.server_info;
        self.capabilities = result.capabilities;

        self.rpc
            .notify(methods::INITIALIZED, Some(Value::Object(Default::default())))
            .await?;
        self.state = ClientState::Initialized;
        Ok(())
    }

    /// Fetch the single page of tools the server offers.
    pub async fn discover_tools(&mut self) -> Result<(), McpError> {
        self.expect_state(ClientState::Initialized)?;

        let response = self.rpc.action_call(methods::TOOLS_LIST).await?;
        let result: ListToolsResult = decode_result(response)?;
        self.tools = result.into_tools();

        info!(
            server = %self.server_info.name,
            count = self.tools.len(),
            "Discovered tools"
        );
        self.state = ClientState::Ready;
        Ok(())
    }

    /// Invoke `name` with `arguments`.
    ///
    /// Error responses are not errors here: they come back as output with
    /// `is_error` set, so the model can see what went wrong.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, Value>,
    ) -> Result<ToolOutput, McpError> {
        self.expect_state(ClientState::Ready)?;

        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let response = self.rpc.call(methods::TOOLS_CALL, Some(params)).await?;

        if let Some(error) = response.error {
            debug!(tool = %name, code = error.code, "Tool returned an error");
            return Ok(ToolOutput {
                content: error.message,
                is_error: true,
            });
        }

        Ok(ToolOutput {
            content: render_result(response.result.unwrap_or(Value::Null)),
            is_error: false,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Server capabilities as sent by the server.
    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// The underlying protocol client.
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    fn expect_state(&self, expected: ClientState) -> Result<(), McpError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(McpError::invalid_state(expected, self.state))
        }
    }
}

fn decode_result<T: DeserializeOwned>(response: Message) -> Result<T, McpError> {
    if let Some(error) = response.error {
        return Err(McpError::server_error(error.code, error.message));
    }
    let result = response.result.unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|e| McpError::protocol(format!("undecodable result: {}", e)))
}

/// Render a tool result payload as text: strings verbatim, objects and
/// arrays as JSON, other scalars via their JSON spelling.
pub fn render_result(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
