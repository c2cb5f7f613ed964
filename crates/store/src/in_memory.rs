//! In-memory entity store: useful for tests and throwaway runs.
//!
//! Records live in three arenas indexed by `id - 1`. A single lock guards
//! all of them, so every trait method is trivially atomic.

use agentchain_core::agent::{AgentDefinition, AgentRecord};
use agentchain_core::chain::{
    AgentId, Chain, ChainId, ChainStatus, ChainSummary, FunctionCall, FunctionCallId, Lease,
    NewChain, duplicate_call_result, order_by_invocation,
};
use agentchain_core::error::StoreError;
use agentchain_core::message::{Message, MessageToolCall};
use agentchain_core::store::{ChainStore, status_after};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

struct ChainRow {
    chain: Chain,
    claim_epoch: i64,
}

#[derive(Default)]
struct Arena {
    agents: Vec<AgentRecord>,
    chains: Vec<ChainRow>,
    calls: Vec<FunctionCall>,
}

fn slot(id: i64) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

fn next_id(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX - 1) + 1
}

impl Arena {
    fn chain(&self, id: ChainId) -> Option<&ChainRow> {
        self.chains.get(slot(id.get())?)
    }

    fn chain_mut(&mut self, id: ChainId) -> Option<&mut ChainRow> {
        let i = slot(id.get())?;
        self.chains.get_mut(i)
    }

    fn call(&self, id: FunctionCallId) -> Option<&FunctionCall> {
        self.calls.get(slot(id.get())?)
    }

    fn call_mut(&mut self, id: FunctionCallId) -> Option<&mut FunctionCall> {
        let i = slot(id.get())?;
        self.calls.get_mut(i)
    }

    fn push_chain(&mut self, new: NewChain) -> Chain {
        let chain = Chain {
            id: ChainId(next_id(self.chains.len())),
            messages: new.messages,
            agent_id: new.agent_id,
            status: ChainStatus::AwaitingLlmProcessing,
            parent_function_call_id: new.parent_function_call_id,
            created_at: Utc::now(),
            claimed_at: None,
            dispatch_attempts: 0,
            retry_after: None,
        };
        self.chains.push(ChainRow {
            chain: chain.clone(),
            claim_epoch: 0,
        });
        chain
    }

    fn push_call(&mut self, chain_id: ChainId, call: &MessageToolCall) -> Option<FunctionCall> {
        if let Some(existing) = self
            .calls
            .iter_mut()
            .find(|fc| fc.chain_id == chain_id && fc.external_id == call.id)
        {
            if existing.added_to_chain_at.is_none() {
                return None;
            }
            // Id reused from an earlier turn: answer the new call with an error.
            existing.function_name = call.name.clone();
            existing.arguments = call.arguments.clone();
            existing.result = Some(duplicate_call_result(&call.id));
            existing.added_to_chain_at = None;
            tracing::warn!(chain_id = %chain_id, external_id = %call.id, "Tool call id reused");
            return Some(existing.clone());
        }
        let fc = FunctionCall {
            id: FunctionCallId(next_id(self.calls.len())),
            chain_id,
            external_id: call.id.clone(),
            function_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: None,
            added_to_chain_at: None,
            child_chain_id: None,
            created_at: Utc::now(),
        };
        self.calls.push(fc.clone());
        Some(fc)
    }

    fn holds(&self, lease: Lease) -> bool {
        self.chain(lease.chain_id).is_some_and(|row| {
            row.chain.status == ChainStatus::LlmProcessing && row.claim_epoch == lease.epoch
        })
    }

    fn unfolded(&self, chain_id: ChainId) -> impl Iterator<Item = &FunctionCall> {
        self.calls
            .iter()
            .filter(move |fc| fc.chain_id == chain_id && fc.added_to_chain_at.is_none())
    }

    fn chains_where(&self, pred: impl Fn(&Chain) -> bool) -> Vec<Chain> {
        let mut out: Vec<Chain> = self
            .chains
            .iter()
            .map(|row| &row.chain)
            .filter(|c| pred(c))
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.created_at, c.id));
        out
    }
}

/// An in-memory [`ChainStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    arena: Arc<RwLock<Arena>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChainStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_agent(&self, agent: &AgentDefinition) -> Result<AgentRecord, StoreError> {
        let mut arena = self.arena.write().await;
        if let Some(existing) = arena.agents.iter_mut().find(|a| a.name == agent.name) {
            existing.system_prompt = agent.system_prompt.clone();
            existing.tools = agent.tools.clone();
            existing.delegation_tool_name = agent.delegation_tool_name();
            existing.delegation_tool_description = agent.delegation_tool_description();
            return Ok(existing.clone());
        }
        let record = AgentRecord {
            id: AgentId(next_id(arena.agents.len())),
            name: agent.name.clone(),
            system_prompt: agent.system_prompt.clone(),
            tools: agent.tools.clone(),
            delegation_tool_name: agent.delegation_tool_name(),
            delegation_tool_description: agent.delegation_tool_description(),
            created_at: Utc::now(),
        };
        arena.agents.push(record.clone());
        Ok(record)
    }

    async fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, StoreError> {
        let arena = self.arena.read().await;
        Ok(arena.agents.iter().find(|a| a.name == name).cloned())
    }

    async fn get_agent_by_id(&self, id: AgentId) -> Result<Option<AgentRecord>, StoreError> {
        let arena = self.arena.read().await;
        Ok(slot(id.get()).and_then(|i| arena.agents.get(i)).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.arena.read().await.agents.clone())
    }

    async fn insert_chain(&self, chain: NewChain) -> Result<Chain, StoreError> {
        let mut arena = self.arena.write().await;
        if slot(chain.agent_id.get()).and_then(|i| arena.agents.get(i)).is_none() {
            return Err(StoreError::Storage(format!(
                "INSERT chain failed: unknown agent id {}",
                chain.agent_id
            )));
        }
        Ok(arena.push_chain(chain))
    }

    async fn get_chain(&self, id: ChainId) -> Result<Option<Chain>, StoreError> {
        let arena = self.arena.read().await;
        Ok(arena.chain(id).map(|row| row.chain.clone()))
    }

    async fn update_chain_status(&self, id: ChainId, status: ChainStatus) -> Result<bool, StoreError> {
        let mut arena = self.arena.write().await;
        let Some(row) = arena.chain_mut(id) else {
            return Ok(false);
        };
        row.chain.status = status;
        row.chain.claimed_at = (status == ChainStatus::LlmProcessing).then(Utc::now);
        Ok(true)
    }

    async fn list_chains(&self) -> Result<Vec<ChainSummary>, StoreError> {
        let arena = self.arena.read().await;
        let chains = arena.chains_where(|_| true);
        let summaries = chains
            .into_iter()
            .map(|chain| {
                let agent_name = slot(chain.agent_id.get())
                    .and_then(|i| arena.agents.get(i))
                    .map(|a| a.name.clone())
                    .unwrap_or_default();
                let parent = chain.parent_function_call_id.and_then(|id| arena.call(id));
                ChainSummary {
                    id: chain.id,
                    agent_id: chain.agent_id,
                    agent_name,
                    parent_function_call_id: chain.parent_function_call_id,
                    parent_external_function_call_id: parent.map(|fc| fc.external_id.clone()),
                    parent_chain_id: parent.map(|fc| fc.chain_id),
                    status: chain.status,
                    created_at: chain.created_at,
                    messages: chain.messages,
                }
            })
            .collect();
        Ok(summaries)
    }

    async fn dispatchable_chains(&self, now: DateTime<Utc>) -> Result<Vec<Chain>, StoreError> {
        let arena = self.arena.read().await;
        Ok(arena.chains_where(|c| c.is_dispatchable(now)))
    }

    async fn claim_chain(&self, id: ChainId, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError> {
        let mut arena = self.arena.write().await;
        let Some(row) = arena.chain_mut(id) else {
            return Ok(None);
        };
        if row.chain.status != ChainStatus::AwaitingLlmProcessing {
            return Ok(None);
        }
        row.chain.status = ChainStatus::LlmProcessing;
        row.chain.claimed_at = Some(now);
        row.claim_epoch += 1;
        Ok(Some(Lease {
            chain_id: id,
            epoch: row.claim_epoch,
        }))
    }

    async fn record_completion(&self, lease: Lease, message: Message) -> Result<bool, StoreError> {
        let mut arena = self.arena.write().await;
        if !arena.holds(lease) {
            return Ok(false);
        }
        for call in message.tool_calls() {
            arena.push_call(lease.chain_id, call);
        }
        let Some(row) = arena.chain_mut(lease.chain_id) else {
            return Ok(false);
        };
        row.chain.status = status_after(&message);
        row.chain.claimed_at = None;
        row.chain.dispatch_attempts = 0;
        row.chain.retry_after = None;
        row.chain.messages.push(message);
        Ok(true)
    }

    async fn record_dispatch_failure(
        &self,
        lease: Lease,
        retry_after: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut arena = self.arena.write().await;
        if !arena.holds(lease) {
            return Ok(false);
        }
        let Some(row) = arena.chain_mut(lease.chain_id) else {
            return Ok(false);
        };
        row.chain.status = ChainStatus::AwaitingLlmProcessing;
        row.chain.claimed_at = None;
        row.chain.dispatch_attempts = row.chain.dispatch_attempts.saturating_add(1);
        row.chain.retry_after = Some(retry_after);
        Ok(true)
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChainId>, StoreError> {
        let mut arena = self.arena.write().await;
        let mut released = Vec::new();
        for row in arena.chains.iter_mut() {
            let stale = row.chain.claimed_at.is_none_or(|at| at < cutoff);
            if row.chain.status == ChainStatus::LlmProcessing && stale {
                row.chain.status = ChainStatus::AwaitingLlmProcessing;
                row.chain.claimed_at = None;
                released.push(row.chain.id);
            }
        }
        Ok(released)
    }

    async fn chains_awaiting_function_call(&self) -> Result<Vec<Chain>, StoreError> {
        let arena = self.arena.read().await;
        Ok(arena.chains_where(|c| c.status == ChainStatus::AwaitingFunctionCall))
    }

    async fn insert_function_call(
        &self,
        chain_id: ChainId,
        call: &MessageToolCall,
    ) -> Result<Option<FunctionCall>, StoreError> {
        let mut arena = self.arena.write().await;
        if arena.chain(chain_id).is_none() {
            return Err(StoreError::Storage(format!(
                "INSERT function call failed: unknown chain {chain_id}"
            )));
        }
        Ok(arena.push_call(chain_id, call))
    }

    async fn get_function_call(&self, id: FunctionCallId) -> Result<Option<FunctionCall>, StoreError> {
        let arena = self.arena.read().await;
        Ok(arena.call(id).cloned())
    }

    async fn function_calls_for_chain(&self, chain_id: ChainId) -> Result<Vec<FunctionCall>, StoreError> {
        let arena = self.arena.read().await;
        Ok(arena
            .calls
            .iter()
            .filter(|fc| fc.chain_id == chain_id)
            .cloned()
            .collect())
    }

    async fn unclaimed_function_calls(&self) -> Result<Vec<FunctionCall>, StoreError> {
        let arena = self.arena.read().await;
        Ok(arena
            .calls
            .iter()
            .filter(|fc| fc.is_unclaimed())
            .cloned()
            .collect())
    }

    async fn set_function_call_result(
        &self,
        id: FunctionCallId,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut arena = self.arena.write().await;
        match arena.call_mut(id) {
            Some(fc) if fc.result.is_none() => {
                fc.result = Some(result.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attach_child_chain(
        &self,
        id: FunctionCallId,
        child: NewChain,
    ) -> Result<Option<Chain>, StoreError> {
        let mut arena = self.arena.write().await;
        if !arena.call(id).is_some_and(FunctionCall::is_unclaimed) {
            return Ok(None);
        }
        let chain = arena.push_chain(child);
        if let Some(fc) = arena.call_mut(id) {
            fc.child_chain_id = Some(chain.id);
        }
        Ok(Some(chain))
    }

    async fn chains_ready_for_fold(&self) -> Result<Vec<ChainId>, StoreError> {
        let arena = self.arena.read().await;
        let ready = arena.chains_where(|c| {
            if c.status != ChainStatus::AwaitingFunctionCall {
                return false;
            }
            let mut pending = arena.unfolded(c.id).peekable();
            pending.peek().is_some() && pending.all(|fc| fc.result.is_some())
        });
        Ok(ready.into_iter().map(|c| c.id).collect())
    }

    async fn fold_results(&self, chain_id: ChainId) -> Result<usize, StoreError> {
        let mut arena = self.arena.write().await;
        let Some(row) = arena.chain(chain_id) else {
            return Ok(0);
        };
        if row.chain.status != ChainStatus::AwaitingFunctionCall {
            return Ok(0);
        }
        let calls: Vec<FunctionCall> = arena.unfolded(chain_id).cloned().collect();
        if calls.is_empty() || calls.iter().any(|fc| fc.result.is_none()) {
            return Ok(0);
        }

        let calls = order_by_invocation(calls, &row.chain.messages);
        let now = Utc::now();
        for fc in &calls {
            if let Some(stored) = arena.call_mut(fc.id) {
                stored.added_to_chain_at = Some(now);
            }
        }
        if let Some(row) = arena.chain_mut(chain_id) {
            row.chain
                .messages
                .extend(calls.iter().filter_map(FunctionCall::to_tool_message));
            row.chain.status = ChainStatus::AwaitingLlmProcessing;
        }
        Ok(calls.len())
    }

    async fn completed_children_awaiting_bubble(&self) -> Result<Vec<Chain>, StoreError> {
        let arena = self.arena.read().await;
        Ok(arena.chains_where(|c| {
            c.status == ChainStatus::StopAwaitingUser
                && c.parent_function_call_id
                    .and_then(|id| arena.call(id))
                    .is_some_and(|fc| fc.result.is_none())
        }))
    }
}
