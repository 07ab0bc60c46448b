//! # conductor-agent
//!
//! Tool server orchestration for Conductor.
//!
//! This crate provides:
//! - Startup of every configured tool server, skipping the ones that fail
//! - The aggregated tool catalog and tool-name resolution
//! - The tool-use loop between the model stream and tool dispatch
//! - Conversation snapshots on disk

pub mod orchestrator;
pub mod store;

pub use orchestrator::{
    AgentConfig, AgentError, AgentEventHandler, AgentResponse, AgentResult, NoOpEventHandler,
    Orchestrator, OrchestratorBuilder,
};
pub use store::ConversationStore;
