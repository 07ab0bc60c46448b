//! # conductor-mcp
//!
//! JSON-RPC tool server client for Conductor.
//!
//! This crate provides:
//! - Newline-delimited framing with leading-noise tolerance
//! - A correlation router owned by a single actor task
//! - The request/notify protocol client with per-request timeouts
//! - The handshake and tool discovery client
//! - Cause-carrying cancellation scopes and per-server supervision
//! - Subprocess, docker and in-process tool server backends

pub mod client;
pub mod error;
pub mod framing;
pub mod lifecycle;
pub mod protocol;
pub mod router;
pub mod rpc;
pub mod transport;

pub use client::{ClientState, McpClient, ToolOutput};
pub use error::{FramingError, McpError, RpcError, TransportError};
pub use lifecycle::{Scope, ScopeEnd, ServerHandle};
pub use protocol::{Message, MessageKind, RequestId};
pub use rpc::{Listeners, RpcClient, RpcConfig};
pub use transport::{Connection, ContainerServer, InProcessServer, ProcessServer, ToolServer};
