//! Built-in local capabilities for agentchain.
//!
//! These are the tools an agent can call in-process. Delegation tools are
//! not registered here; the agent registry synthesizes them per agent.

pub mod add;
pub mod calculator;

use agentchain_core::error::ToolError;
use agentchain_core::tool::ToolRegistry;
use std::sync::Arc;

pub use add::AddTool;
pub use calculator::CalculatorTool;

/// Create a tool registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(add::AddTool));
    registry.register(Arc::new(calculator::CalculatorTool));
    registry
}

/// JSON number for an arithmetic result; integral values become integers.
pub(crate) fn number_value(tool_name: &str, value: f64) -> Result<serde_json::Value, ToolError> {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return Ok(serde_json::Value::from(value as i64));
    }
    serde_json::Number::from_f64(value)
        .map(serde_json::Value::Number)
        .ok_or_else(|| ToolError::ExecutionFailed {
            tool_name: tool_name.into(),
            reason: format!("result {value} is not a finite number"),
        })
}
