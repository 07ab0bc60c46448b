//! Tool server client error types.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::ScopeEnd;

/// Errors produced while turning a byte stream into messages.
#[derive(Debug, Error)]
pub enum FramingError {
    /// A line could not be decoded as a protocol message.
    #[error("malformed message line ({preview}): {source}")]
    Malformed {
        preview: String,
        #[source]
        source: serde_json::Error,
    },

    /// The underlying stream failed.
    #[error("read error: {0}")]
    Read(#[from] std::io::Error),
}

/// Errors that can occur while opening or running a tool server byte stream.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the child process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(std::io::Error),

    /// The child process exited unsuccessfully.
    #[error("process exited with {0}")]
    Exited(std::process::ExitStatus),

    /// Waiting on the child process failed.
    #[error("failed to wait for process: {0}")]
    WaitFailed(std::io::Error),

    /// Failed to terminate the process.
    #[error("failed to terminate process: {0}")]
    TerminateFailed(std::io::Error),

    /// The server configuration cannot be used to open a stream.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),
}

/// Errors returned by the protocol client for a single request.
#[derive(Debug, Error)]
pub enum RpcError {
    /// An id was registered while a request with the same id was pending.
    #[error("duplicate request id: {0}")]
    DuplicateId(String),

    /// Writing the framed request failed.
    #[error("write error: {0}")]
    Write(std::io::Error),

    /// No response arrived within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection went away before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// The protocol scope ended while the request was outstanding.
    #[error("cancelled: {0}")]
    Cancelled(ScopeEnd),
}

/// Errors that can occur during handshake and tool operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Request-level error.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level error (undecodable results, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server initialization failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Server returned an error response.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i64, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client is not in the correct state.
    #[error("invalid client state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an initialization failed error.
    pub fn init_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a server error from an error response.
    pub fn server_error(code: i64, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl ToString, actual: impl ToString) -> Self {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
