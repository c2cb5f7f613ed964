//! Tool resolver: what does a requested function name refer to?

use agentchain_core::agent::delegation_target;
use agentchain_core::tool::{Tool, ToolRegistry};
use std::sync::Arc;

/// How a function call will be carried out.
pub enum Resolution {
    /// A capability in the local tool table.
    Local(Arc<dyn Tool>),
    /// `delegate_to_<agent>`: spawn a child chain for the named agent.
    Delegate(String),
    Unknown,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(tool) => f.debug_tuple("Local").field(&tool.name()).finish(),
            Self::Delegate(agent) => f.debug_tuple("Delegate").field(agent).finish(),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolResolver {
    tools: ToolRegistry,
}

impl ToolResolver {
    pub fn new(tools: ToolRegistry) -> Self {
        Self { tools }
    }

    /// Exact local names win over the delegation prefix.
    pub fn resolve(&self, function_name: &str) -> Resolution {
        if let Some(tool) = self.tools.get(function_name) {
            return Resolution::Local(tool);
        }
        match delegation_target(function_name) {
            Some(agent) => Resolution::Delegate(agent.to_string()),
            None => Resolution::Unknown,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentchain_core::error::ToolError;
    use async_trait::async_trait;

    struct Shadow;

    #[async_trait]
    impl Tool for Shadow {
        fn name(&self) -> &str {
            "delegate_to_nobody"
        }
        fn description(&self) -> &str {
            "a local tool that looks like a delegation"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!("shadowed"))
        }
    }

    #[test]
    fn classifies_names() {
        let resolver = ToolResolver::new(agentchain_tools::default_registry());

        assert!(matches!(resolver.resolve("add"), Resolution::Local(t) if t.name() == "add"));
        assert!(matches!(
            resolver.resolve("delegate_to_calculator_operator"),
            Resolution::Delegate(a) if a == "calculator_operator"
        ));
        assert!(matches!(resolver.resolve("multiply"), Resolution::Unknown));
        assert!(matches!(resolver.resolve("delegate_to_"), Resolution::Unknown));
    }

    #[test]
    fn local_lookup_wins_over_prefix() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Shadow));
        let resolver = ToolResolver::new(tools);
        assert!(matches!(resolver.resolve("delegate_to_nobody"), Resolution::Local(_)));
    }
}
