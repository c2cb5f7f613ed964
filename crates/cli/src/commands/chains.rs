//! `agentchain chains`: dump stored chains as JSON.

use super::{CommandResult, load_config, open_store};
use agentchain_orchestrator::ChainService;

pub async fn run(tree: bool) -> CommandResult {
    let config = load_config()?;
    let service = ChainService::new(open_store(&config).await?);

    let json = if tree {
        serde_json::to_string_pretty(&service.chain_tree().await?)?
    } else {
        serde_json::to_string_pretty(&service.list_chains().await?)?
    };
    println!("{json}");
    Ok(())
}
