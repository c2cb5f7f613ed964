//! Agent registry: the static, name-keyed catalog of agent definitions.
//!
//! Built once from `[[agents]]` config. Each agent's tool schema is its local
//! tools (looked up in the [`ToolRegistry`]) followed by one synthesized
//! `delegate_to_<name>` tool per agent it may delegate to.

use agentchain_config::AgentConfig;
use agentchain_core::agent::{AgentDefinition, AgentRecord};
use agentchain_core::error::{Error, Result};
use agentchain_core::store::ChainStore;
use agentchain_core::tool::ToolRegistry;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentDefinition>,
    by_name: HashMap<String, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog, rejecting unknown tools and delegates.
    pub fn from_config(configs: &[AgentConfig], tools: &ToolRegistry) -> Result<Self> {
        let mut registry = Self::new();

        for config in configs {
            if registry.get(&config.name).is_some() {
                return Err(config_error(format!("duplicate agent '{}'", config.name)));
            }
            let mut agent = AgentDefinition::new(&config.name, &config.system_prompt);
            if let Some(description) = &config.description {
                agent = agent.with_delegation_description(description);
            }
            for tool_name in &config.tools {
                let tool = tools.get(tool_name).ok_or_else(|| {
                    config_error(format!(
                        "agent '{}' uses unknown tool '{tool_name}'",
                        config.name
                    ))
                })?;
                agent = agent.with_tool(tool.to_definition());
            }
            registry.register(agent);
        }

        // Delegation tools need every target's description, so they are
        // added once all agents exist.
        for config in configs {
            let mut delegation_tools = Vec::with_capacity(config.delegates.len());
            for target in &config.delegates {
                let sub = registry.get(target).ok_or_else(|| {
                    config_error(format!(
                        "agent '{}' delegates to unknown agent '{target}'",
                        config.name
                    ))
                })?;
                delegation_tools.push(sub.delegation_tool());
            }
            if let Some(&idx) = registry.by_name.get(&config.name) {
                registry.agents[idx].tools.extend(delegation_tools);
            }
        }

        Ok(registry)
    }

    /// Add or replace an agent.
    pub fn register(&mut self, agent: AgentDefinition) {
        match self.by_name.get(&agent.name) {
            Some(&idx) => self.agents[idx] = agent,
            None => {
                self.by_name.insert(agent.name.clone(), self.agents.len());
                self.agents.push(agent);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentDefinition> {
        self.by_name.get(name).map(|&idx| &self.agents[idx])
    }

    /// Definitions in registration order.
    pub fn definitions(&self) -> &[AgentDefinition] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Upsert every agent into the store.
    pub async fn persist(&self, store: &dyn ChainStore) -> Result<Vec<AgentRecord>> {
        let mut records = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let record = store.upsert_agent(agent).await?;
            info!(
                agent = %record.name,
                agent_id = %record.id,
                tools = record.tools.len(),
                "Agent registered"
            );
            records.push(record);
        }
        Ok(records)
    }
}

fn config_error(message: String) -> Error {
    Error::Config { message }
}
