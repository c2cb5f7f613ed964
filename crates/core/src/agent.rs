//! Agent definitions and the delegation tool derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::chain::AgentId;
use crate::provider::ToolDefinition;

/// Prefix of every synthesized delegation tool name.
pub const DELEGATION_PREFIX: &str = "delegate_to_";

/// A named agent: instructions plus the tools it may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique agent name
    pub name: String,

    /// System instructions seeded as the first message of every chain
    pub system_prompt: String,

    /// Tool schemas offered to the model, local and delegation tools alike
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,

    /// Description used when other agents delegate to this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_description: Option<String>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            delegation_description: None,
        }
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_delegation_description(mut self, description: impl Into<String>) -> Self {
        self.delegation_description = Some(description.into());
        self
    }

    /// `delegate_to_<name>`
    pub fn delegation_tool_name(&self) -> String {
        format!("{DELEGATION_PREFIX}{}", self.name)
    }

    pub fn delegation_tool_description(&self) -> String {
        self.delegation_description
            .clone()
            .unwrap_or_else(|| format!("delegate to {}", self.name))
    }

    /// The tool other agents call to hand a sub-task to this agent.
    pub fn delegation_tool(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.delegation_tool_name(),
            description: self.delegation_tool_description(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "the full message to send to the agent including all supporting context and details"
                    }
                },
                "required": ["message"]
            }),
        }
    }
}

/// The agent name a delegation tool targets, if `function_name` is one.
pub fn delegation_target(function_name: &str) -> Option<&str> {
    function_name
        .strip_prefix(DELEGATION_PREFIX)
        .filter(|name| !name.is_empty())
}

/// An agent as persisted in the entity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub delegation_tool_name: String,
    pub delegation_tool_description: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegation_tool_defaults_description() {
        let agent = AgentDefinition::new("calculator_operator", "You are a skilled calculator operator");
        let tool = agent.delegation_tool();
        assert_eq!(tool.name, "delegate_to_calculator_operator");
        assert_eq!(tool.description, "delegate to calculator_operator");
        assert_eq!(tool.parameters["properties"]["message"]["type"], "string");
    }

    #[test]
    fn delegation_tool_uses_custom_description() {
        let agent = AgentDefinition::new("pm", "plan things").with_delegation_description("a planner");
        assert_eq!(agent.delegation_tool().description, "a planner");
    }

    #[test]
    fn delegation_target_parsing() {
        assert_eq!(delegation_target("delegate_to_ghost"), Some("ghost"));
        assert_eq!(delegation_target("delegate_to_"), None);
        assert_eq!(delegation_target("add"), None);
    }
}
