//! `agentchain agents`: list the configured agent catalog.

use super::{CommandResult, load_config};
use agentchain_orchestrator::AgentRegistry;

pub async fn run() -> CommandResult {
    let config = load_config()?;
    let registry = AgentRegistry::from_config(&config.agents, &agentchain_tools::default_registry())?;

    println!("🤖 Agents ({})\n", registry.len());
    for agent in registry.definitions() {
        println!("  {}", agent.name);
        println!("    delegation tool: {}", agent.delegation_tool_name());
        for tool in &agent.tools {
            println!("    - {}: {}", tool.name, tool.description);
        }
    }
    Ok(())
}
