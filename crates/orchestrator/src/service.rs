//! Chain service: the operations exposed to the HTTP API and the CLI.
//!
//! Creating a chain only inserts it; the scheduler picks it up on its next
//! tick.

use agentchain_core::agent::AgentRecord;
use agentchain_core::chain::{Chain, ChainId, ChainSummary, ChainTreeNode, NewChain, build_tree};
use agentchain_core::error::{Error, Result};
use agentchain_core::store::ChainStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct ChainService {
    store: Arc<dyn ChainStore>,
}

impl ChainService {
    pub fn new(store: Arc<dyn ChainStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    /// Start a root chain for `agent_name` seeded with the user's request.
    pub async fn create_chain(&self, agent_name: &str, user_message: &str) -> Result<Chain> {
        let agent = self
            .store
            .get_agent(agent_name)
            .await?
            .ok_or_else(|| Error::AgentNotFound(agent_name.to_string()))?;

        let chain = self
            .store
            .insert_chain(NewChain::root(agent.id, agent.system_prompt, user_message))
            .await?;
        info!(chain_id = %chain.id, agent = %agent.name, "Chain created");
        Ok(chain)
    }

    pub async fn get_chain(&self, id: ChainId) -> Result<Chain> {
        self.store
            .get_chain(id)
            .await?
            .ok_or(Error::ChainNotFound(id))
    }

    /// Every chain, oldest first.
    pub async fn list_chains(&self) -> Result<Vec<ChainSummary>> {
        Ok(self.store.list_chains().await?)
    }

    /// Chains nested under the delegation call that spawned them.
    pub async fn chain_tree(&self) -> Result<Vec<ChainTreeNode>> {
        Ok(build_tree(self.store.list_chains().await?))
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        Ok(self.store.list_agents().await?)
    }

    /// Poll until the chain reaches `stop_awaiting_user`.
    ///
    /// Waits forever; wrap it in `tokio::time::timeout` to bound it.
    pub async fn wait_until_stopped(&self, id: ChainId, poll: Duration) -> Result<Chain> {
        loop {
            let chain = self.get_chain(id).await?;
            if chain.status.is_terminal() {
                return Ok(chain);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
