//! ChainStore trait: the entity store contract.
//!
//! The orchestrator never touches storage directly; every read and write
//! goes through this trait. Implementations must provide:
//! - atomic id assignment
//! - idempotent function call insertion keyed by `(chain_id, external_id)`
//! - all-or-nothing writes for [`ChainStore::record_completion`],
//!   [`ChainStore::attach_child_chain`] and [`ChainStore::fold_results`]
//!
//! Batch queries return rows oldest first (`created_at`, then id).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::agent::{AgentDefinition, AgentRecord};
use crate::chain::{
    AgentId, Chain, ChainId, ChainStatus, ChainSummary, FunctionCall, FunctionCallId, Lease,
    NewChain,
};
use crate::error::StoreError;
use crate::message::{Message, MessageToolCall};

#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    // --- Agents ---

    /// Insert or update an agent by name.
    async fn upsert_agent(&self, agent: &AgentDefinition) -> Result<AgentRecord, StoreError>;

    async fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, StoreError>;

    async fn get_agent_by_id(&self, id: AgentId) -> Result<Option<AgentRecord>, StoreError>;

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;

    // --- Chains ---

    /// Insert a chain in `awaiting_llm_processing`.
    async fn insert_chain(&self, chain: NewChain) -> Result<Chain, StoreError>;

    async fn get_chain(&self, id: ChainId) -> Result<Option<Chain>, StoreError>;

    /// Unconditionally set a chain's status. Returns false if it does not exist.
    async fn update_chain_status(&self, id: ChainId, status: ChainStatus) -> Result<bool, StoreError>;

    /// Every chain with its agent name and parent linkage.
    async fn list_chains(&self) -> Result<Vec<ChainSummary>, StoreError>;

    // --- Dispatch ---

    /// Chains in `awaiting_llm_processing` whose retry delay has passed.
    async fn dispatchable_chains(&self, now: DateTime<Utc>) -> Result<Vec<Chain>, StoreError>;

    /// Move a chain from `awaiting_llm_processing` to `llm_processing`.
    ///
    /// Returns `None` when the chain was not in `awaiting_llm_processing`,
    /// i.e. another worker won the claim.
    async fn claim_chain(&self, id: ChainId, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError>;

    /// Append the model's reply, record its tool calls and move the chain
    /// to the status the reply implies, in one transaction.
    ///
    /// Returns false (and writes nothing) if the lease is no longer held.
    async fn record_completion(&self, lease: Lease, message: Message) -> Result<bool, StoreError>;

    /// Return a claimed chain to `awaiting_llm_processing` after a failed
    /// completion, bumping its attempt count and deferring it.
    async fn record_dispatch_failure(
        &self,
        lease: Lease,
        retry_after: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Return chains claimed before `cutoff` to `awaiting_llm_processing`.
    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChainId>, StoreError>;

    /// Chains in `awaiting_function_call`.
    async fn chains_awaiting_function_call(&self) -> Result<Vec<Chain>, StoreError>;

    // --- Function calls ---

    /// Insert a function call. Returns `None` if `(chain_id, call.id)`
    /// already exists and is not yet folded.
    ///
    /// If the existing row was already folded (the model reused an id from
    /// an earlier turn), the row is re-armed with the new name and arguments
    /// and a `duplicate tool call id` error result, so the chain can fold
    /// again instead of waiting forever.
    async fn insert_function_call(
        &self,
        chain_id: ChainId,
        call: &MessageToolCall,
    ) -> Result<Option<FunctionCall>, StoreError>;

    async fn get_function_call(&self, id: FunctionCallId) -> Result<Option<FunctionCall>, StoreError>;

    async fn function_calls_for_chain(&self, chain_id: ChainId) -> Result<Vec<FunctionCall>, StoreError>;

    /// Calls with neither a result nor a child chain.
    async fn unclaimed_function_calls(&self) -> Result<Vec<FunctionCall>, StoreError>;

    /// Set a call's result if it has none. Returns whether it was written.
    async fn set_function_call_result(
        &self,
        id: FunctionCallId,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Create `child` and record it on the call, in one transaction.
    ///
    /// Returns `None` if the call already has a result or a child.
    async fn attach_child_chain(
        &self,
        id: FunctionCallId,
        child: NewChain,
    ) -> Result<Option<Chain>, StoreError>;

    // --- Fold & bubble ---

    /// Chains in `awaiting_function_call` with at least one unfolded call
    /// and no unfolded call still lacking a result.
    async fn chains_ready_for_fold(&self) -> Result<Vec<ChainId>, StoreError>;

    /// Append one tool message per unfolded call in invocation order, stamp
    /// `added_to_chain_at` and move the chain to `awaiting_llm_processing`,
    /// all in one transaction.
    ///
    /// Returns the number of calls folded; 0 if the chain was no longer
    /// ready.
    async fn fold_results(&self, chain_id: ChainId) -> Result<usize, StoreError>;

    /// Finished child chains whose parent call still has no result.
    async fn completed_children_awaiting_bubble(&self) -> Result<Vec<Chain>, StoreError>;
}

/// The status a chain moves to once `message` is appended.
pub fn status_after(message: &Message) -> ChainStatus {
    if message.tool_calls().is_empty() {
        ChainStatus::StopAwaitingUser
    } else {
        ChainStatus::AwaitingFunctionCall
    }
}
