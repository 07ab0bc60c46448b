//! # conductor-core
//!
//! Core types and abstractions shared by every Conductor crate.
//!
//! This crate provides:
//! - Conversation primitives (turns, roles, content blocks)
//! - Tool descriptors as discovered from tool servers
//! - Configuration system
//! - Common error types

pub mod config;
pub mod error;
pub mod message;
pub mod tool;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{ContentBlock, Conversation, Role, Turn};
pub use tool::ToolDescriptor;
