//! Message domain types.
//!
//! A chain is an append-only list of [`Message`]s. The set of roles is
//! closed, so a message is an enum rather than a loosely typed JSON blob;
//! the JSON shape only appears at the store and gateway boundaries.

use serde::{Deserialize, Serialize};

/// The role of a message sender in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Agent instructions
    System,
    /// The requester (end user or delegating parent)
    User,
    /// The language model
    Assistant,
    /// Tool execution result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// A single message in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        /// Absent when the model only requested tool calls
        #[serde(default)]
        content: Option<String>,

        /// Tool calls requested by the model, in invocation order
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<MessageToolCall>,
    },
    Tool {
        /// The tool call this message answers
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Create a plain assistant answer.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(
        content: Option<String>,
        tool_calls: Vec<MessageToolCall>,
    ) -> Self {
        Self::Assistant {
            content,
            tool_calls,
        }
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::Tool { .. } => Role::Tool,
        }
    }

    /// The text content, if any.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::System { content } | Self::User { content } | Self::Tool { content, .. } => {
                Some(content.as_str())
            }
            Self::Assistant { content, .. } => content.as_deref(),
        }
    }

    /// Tool calls requested by this message (empty for non-assistant roles).
    pub fn tool_calls(&self) -> &[MessageToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// An assistant message without tool calls ends a chain's turn.
    pub fn is_final_answer(&self) -> bool {
        matches!(self, Self::Assistant { tool_calls, .. } if tool_calls.is_empty())
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Correlation id issued by the model
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as the raw JSON text the model produced
    pub arguments: String,
}

impl MessageToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// The most recent assistant message in a history.
pub fn last_assistant(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|m| m.role() == Role::Assistant)
}
