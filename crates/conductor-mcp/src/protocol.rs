//! Protocol types.
//!
//! A single [`Message`] shape covers every JSON-RPC 2.0 message; which fields
//! are populated decides its [`MessageKind`]. The handshake and tool payloads
//! below ride inside `params`/`result`.

use std::fmt;

use conductor_core::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Tool server protocol version sent during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names used by the handshake and tool invocation.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Request ID for JSON-RPC messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric ID.
    Number(i64),
    /// String ID.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Which of the four JSON-RPC shapes a message has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    ErrorResponse,
}

/// Any JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl Message {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Create a request.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Create a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Create a success response.
    pub fn response(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Create an error response.
    pub fn error_response(id: impl Into<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            ..Self::empty()
        }
    }

    /// Classify the message by its populated fields.
    ///
    /// Returns `None` for a message with neither `id` nor `method`. A response
    /// whose `result` was JSON `null` has no `result` after decoding and is
    /// still a [`MessageKind::Response`].
    pub fn kind(&self) -> Option<MessageKind> {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => Some(MessageKind::Request),
            (None, Some(_)) => Some(MessageKind::Notification),
            (Some(_), None) if self.error.is_some() => Some(MessageKind::ErrorResponse),
            (Some(_), None) => Some(MessageKind::Response),
            (None, None) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ============================================================================
// Handshake and tool payloads
// ============================================================================

/// Client information sent during initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "conductor".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server information returned during initialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Client capabilities for initialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Roots capability (for file system access).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
}

/// Roots capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

/// Parameters for the initialize request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo::default(),
        }
    }
}

/// Result of the initialize request.
///
/// Capabilities are kept as raw JSON; nothing downstream negotiates on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: ServerInfo,
}

/// Result of the tools/list request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// `null` and a missing field both decode to `None`.
    #[serde(default)]
    pub tools: Option<Vec<ToolDescriptor>>,
}

impl ListToolsResult {
    pub fn into_tools(self) -> Vec<ToolDescriptor> {
        self.tools.unwrap_or_default()
    }
}

/// Parameters for the tools/call request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: &Message) -> Message {
        let line = serde_json::to_string(message).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_request_fixture() {
        let msg = Message::request("1", "tools/list", None);
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"jsonrpc":"2.0","id":"1","method":"tools/list"}"#
        );
        let back = round_trip(&msg);
        assert_eq!(back, msg);
        assert_eq!(back.kind(), Some(MessageKind::Request));
    }

    #[test]
    fn test_notification_fixture() {
        let msg = Message::notification("notifications/initialized", Some(json!({})));
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized","params":{}}"#
        );
        assert_eq!(round_trip(&msg).kind(), Some(MessageKind::Notification));
    }

    #[test]
    fn test_response_fixture() {
        let msg: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(msg.id, Some(RequestId::Number(7)));
        assert_eq!(msg.kind(), Some(MessageKind::Response));
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_error_response_fixture() {
        let msg: Message = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-32601,"message":"Method not found","data":{"m":"x"}}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), Some(MessageKind::ErrorResponse));
        let error = msg.error.as_ref().unwrap();
        assert_eq!(error.code, RpcErrorObject::METHOD_NOT_FOUND);
        assert_eq!(error.data, Some(json!({"m": "x"})));
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_null_result_is_still_a_response() {
        let msg: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(msg.kind(), Some(MessageKind::Response));
    }

    #[test]
    fn test_initialize_params_shape() {
        let value = serde_json::to_value(InitializeParams::default()).unwrap();
        assert_eq!(value["protocolVersion"], "2024-11-05");
        assert_eq!(value["clientInfo"]["name"], "conductor");
        assert!(value["capabilities"].is_object());
    }

    #[test]
    fn test_list_tools_null_and_missing() {
        let missing: ListToolsResult = serde_json::from_value(json!({})).unwrap();
        assert!(missing.into_tools().is_empty());

        let null: ListToolsResult = serde_json::from_value(json!({"tools": null})).unwrap();
        assert!(null.into_tools().is_empty());

        let some: ListToolsResult = serde_json::from_value(json!({
            "tools": [{"name": "echo", "inputSchema": {"type": "object"}}]
        }))
        .unwrap();
        assert_eq!(some.into_tools()[0].name, "echo");
    }
}
