//! Chain and FunctionCall domain types.
//!
//! A chain is one agent conversation. Every tool call the model issues in a
//! chain becomes a [`FunctionCall`] row; a delegation call additionally owns
//! a child chain, which is how the delegation tree is formed. Records refer
//! to each other by integer id only, so the tree is an arena rather than a
//! web of owned pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use crate::error::ToolError;
use crate::message::{Message, last_assistant};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Store-assigned chain identifier.
    ChainId
);
entity_id!(
    /// Store-assigned function call identifier.
    FunctionCallId
);
entity_id!(
    /// Store-assigned agent identifier.
    AgentId
);

/// Lifecycle state of a chain.
///
/// ```text
/// awaiting_llm_processing ──claim──▶ llm_processing ──┬─▶ awaiting_function_call
///            ▲                                         └─▶ stop_awaiting_user
///            └──────────── all results folded ◀──────────────┘ (from awaiting_function_call)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    AwaitingLlmProcessing,
    LlmProcessing,
    AwaitingFunctionCall,
    StopAwaitingUser,
}

impl ChainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingLlmProcessing => "awaiting_llm_processing",
            Self::LlmProcessing => "llm_processing",
            Self::AwaitingFunctionCall => "awaiting_function_call",
            Self::StopAwaitingUser => "stop_awaiting_user",
        }
    }

    /// Whether the orchestrator will never advance this chain again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::StopAwaitingUser)
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chain status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ChainStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_llm_processing" => Ok(Self::AwaitingLlmProcessing),
            "llm_processing" => Ok(Self::LlmProcessing),
            "awaiting_function_call" => Ok(Self::AwaitingFunctionCall),
            "stop_awaiting_user" => Ok(Self::StopAwaitingUser),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: ChainId,

    /// Append-only history
    pub messages: Vec<Message>,

    pub agent_id: AgentId,

    pub status: ChainStatus,

    /// Set when this chain was spawned by a delegation call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_function_call_id: Option<FunctionCallId>,

    pub created_at: DateTime<Utc>,

    /// When the current `llm_processing` claim was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Consecutive completion failures since the last success
    #[serde(default)]
    pub dispatch_attempts: u32,

    /// Dispatch is deferred until this instant after a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl Chain {
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The answer text, if the chain ended with a plain assistant message.
    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.is_final_answer())
            .and_then(|m| m.content())
    }

    /// Tool calls of the most recent assistant message.
    pub fn pending_tool_calls(&self) -> &[crate::message::MessageToolCall] {
        last_assistant(&self.messages)
            .map(|m| m.tool_calls())
            .unwrap_or(&[])
    }

    /// Whether the chain may be handed to the completion gateway at `now`.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == ChainStatus::AwaitingLlmProcessing
            && self.retry_after.is_none_or(|t| t <= now)
    }
}

/// Everything needed to insert a chain.
#[derive(Debug, Clone)]
pub struct NewChain {
    pub agent_id: AgentId,
    pub messages: Vec<Message>,
    pub parent_function_call_id: Option<FunctionCallId>,
}

impl NewChain {
    /// A root chain seeded with the agent's instructions and a user request.
    pub fn root(
        agent_id: AgentId,
        system_prompt: impl Into<String>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            agent_id,
            messages: vec![Message::system(system_prompt), Message::user(user_message)],
            parent_function_call_id: None,
        }
    }

    /// A child chain seeded from a delegation call.
    pub fn delegated(
        agent_id: AgentId,
        system_prompt: impl Into<String>,
        message: impl Into<String>,
        parent: FunctionCallId,
    ) -> Self {
        Self {
            agent_id,
            messages: vec![Message::system(system_prompt), Message::user(message)],
            parent_function_call_id: Some(parent),
        }
    }
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: FunctionCallId,
    pub chain_id: ChainId,

    /// Correlation id issued by the model
    pub external_id: String,

    pub function_name: String,

    /// Raw JSON argument text as issued by the model
    pub arguments: String,

    /// Set exactly once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// When the result was folded into the owning chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_to_chain_at: Option<DateTime<Utc>>,

    /// The chain spawned by a delegation call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_chain_id: Option<ChainId>,

    pub created_at: DateTime<Utc>,
}

impl FunctionCall {
    /// Decode the argument text.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, ToolError> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments).map_err(|e| {
            ToolError::InvalidArguments(format!("{}: {e}", self.function_name))
        })
    }

    /// Neither executed nor delegated yet.
    pub fn is_unclaimed(&self) -> bool {
        self.result.is_none() && self.child_chain_id.is_none()
    }

    /// The tool message this call contributes to its chain, once resolved.
    pub fn to_tool_message(&self) -> Option<Message> {
        self.result.as_ref().map(|result| {
            Message::tool_result(&self.external_id, &self.function_name, result_content(result))
        })
    }
}

/// Tool message content for a result value: strings verbatim, anything
/// else as compact JSON.
pub fn result_content(result: &serde_json::Value) -> String {
    match result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The soft-error result payload `{"error": "<reason>"}`.
pub fn error_result(reason: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "error": reason.to_string() })
}

/// Result stored when a model reuses a call id already folded into the chain.
pub fn duplicate_call_result(external_id: &str) -> serde_json::Value {
    error_result(format!("duplicate tool call id {external_id}"))
}

/// Sort calls into the order the model issued them, as recorded by the
/// last assistant message. Calls not named there keep id order at the end.
pub fn order_by_invocation(mut calls: Vec<FunctionCall>, messages: &[Message]) -> Vec<FunctionCall> {
    let position: HashMap<&str, usize> = last_assistant(messages)
        .map(|m| {
            m.tool_calls()
                .iter()
                .enumerate()
                .map(|(i, tc)| (tc.id.as_str(), i))
                .collect()
        })
        .unwrap_or_default();

    calls.sort_by_key(|fc| {
        (
            position.get(fc.external_id.as_str()).copied().unwrap_or(usize::MAX),
            fc.id,
        )
    });
    calls
}

/// A held `llm_processing` claim. Writes made under a lease only land if
/// the chain has not been reclaimed since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub chain_id: ChainId,
    pub epoch: i64,
}

/// A chain as listed over the API, with its parent linkage resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSummary {
    pub id: ChainId,
    pub messages: Vec<Message>,
    pub status: ChainStatus,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub parent_function_call_id: Option<FunctionCallId>,
    pub parent_external_function_call_id: Option<String>,
    pub parent_chain_id: Option<ChainId>,
    pub created_at: DateTime<Utc>,
}

/// A node of the delegation forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTreeNode {
    pub chain: ChainSummary,
    pub children: Vec<ChainTreeNode>,
}

impl ChainTreeNode {
    /// Number of chains in this subtree, itself included.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(ChainTreeNode::size).sum::<usize>()
    }
}

/// Rebuild the delegation forest from a flat listing.
///
/// Input order is preserved among siblings and roots. A chain whose parent
/// chain is missing from the listing becomes a root.
pub fn build_tree(summaries: Vec<ChainSummary>) -> Vec<ChainTreeNode> {
    let index: HashMap<ChainId, usize> = summaries
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id, i))
        .collect();

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); summaries.len()];
    let mut roots = Vec::new();
    for (i, summary) in summaries.iter().enumerate() {
        match summary.parent_chain_id.and_then(|p| index.get(&p)) {
            Some(&parent) if parent != i => children[parent].push(i),
            _ => roots.push(i),
        }
    }

    let mut slots: Vec<Option<ChainSummary>> = summaries.into_iter().map(Some).collect();
    roots
        .into_iter()
        .filter_map(|i| take_subtree(i, &mut slots, &children))
        .collect()
}

fn take_subtree(
    i: usize,
    slots: &mut [Option<ChainSummary>],
    children: &[Vec<usize>],
) -> Option<ChainTreeNode> {
    let chain = slots[i].take()?;
    let children = children[i]
        .iter()
        .filter_map(|&c| take_subtree(c, slots, children))
        .collect();
    Some(ChainTreeNode { chain, children })
}
