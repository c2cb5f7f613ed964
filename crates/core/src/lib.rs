//! # agentchain Core
//!
//! Domain types, traits, and error definitions for the agentchain
//! orchestration engine. This crate has **no framework dependencies**: it
//! defines the model every other crate implements against.
//!
//! ## Layout
//!
//! - [`chain`]: chains, function calls, statuses and the delegation tree
//! - [`message`]: the closed, role-tagged message type stored in a chain
//! - [`agent`]: agent definitions and the derived delegation tool
//! - [`provider`]: the completion gateway trait
//! - [`tool`]: local capabilities and their registry
//! - [`store`]: the entity store contract

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;
pub mod agent;
pub mod chain;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition};
pub use tool::{Tool, ToolRegistry};
pub use agent::{AgentDefinition, AgentRecord};
pub use chain::{
    AgentId, Chain, ChainId, ChainStatus, ChainSummary, ChainTreeNode, FunctionCall,
    FunctionCallId, Lease, NewChain,
};
pub use store::ChainStore;
