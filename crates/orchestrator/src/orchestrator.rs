//! The orchestrator: one tick of the chain state machine.
//!
//! A tick first returns expired claims to the dispatch queue, then runs four
//! phases in order, each over a fresh batch read from the store:
//!
//! 1. **Dispatch**: claim chains awaiting the model, call the completion
//!    gateway and record the reply with its function calls.
//! 2. **Execute**: run unclaimed function calls locally, or spawn a child
//!    chain for delegations.
//! 3. **Fold**: once every call of a chain has a result, append the tool
//!    messages and hand the chain back to the model.
//! 4. **Bubble**: copy a finished child chain's answer into its parent call.
//!
//! Store failures abort only the item being processed; the next tick picks
//! it up again.

use crate::resolver::{Resolution, ToolResolver};
use agentchain_config::AppConfig;
use agentchain_core::chain::{Chain, ChainId, FunctionCall, Lease, NewChain, error_result};
use agentchain_core::error::{Error, StoreError, ToolError};
use agentchain_core::message::{Message, Role};
use agentchain_core::provider::{Provider, ProviderRequest};
use agentchain_core::store::ChainStore;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on the delay between dispatch attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Tuning knobs for a tick.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Model requested from the completion gateway
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,

    /// Completion calls in flight at once during dispatch
    pub max_concurrent_dispatches: usize,

    /// Bound on a single completion call
    pub completion_timeout: Duration,

    /// How long a claim may stay in `llm_processing` before it is released
    pub claim_timeout: Duration,

    /// Consecutive gateway failures before a chain is finished with an error
    pub max_dispatch_attempts: u32,

    /// Base delay of the exponential retry backoff
    pub retry_backoff: Duration,

    /// Deepest chain allowed to delegate further
    pub max_delegation_depth: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let orchestrator = &config.orchestrator;
        Self {
            model: config.default_model.clone(),
            temperature: config.default_temperature,
            max_tokens: Some(config.default_max_tokens),
            max_concurrent_dispatches: orchestrator.max_concurrent_dispatches,
            completion_timeout: orchestrator.completion_timeout(),
            claim_timeout: orchestrator.claim_timeout(),
            max_dispatch_attempts: orchestrator.max_dispatch_attempts,
            retry_backoff: orchestrator.retry_backoff(),
            max_delegation_depth: orchestrator.max_delegation_depth,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// What one tick did, per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Expired claims returned to the dispatch queue
    pub released: usize,
    /// Chains whose completion was recorded
    pub dispatched: usize,
    /// Completion calls that failed or timed out
    pub dispatch_failures: usize,
    /// Function calls that received a result during execution
    pub executed: usize,
    /// Child chains spawned
    pub delegated: usize,
    /// Chains whose results were folded back in
    pub folded: usize,
    /// Child answers copied into parent calls
    pub bubbled: usize,
}

impl TickReport {
    /// Nothing moved.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Backoff before dispatch attempt `attempts + 1`: `base * 2^(attempts - 1)`,
/// capped at [`MAX_RETRY_DELAY`].
pub fn retry_delay(base: Duration, attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

enum DispatchOutcome {
    Recorded,
    Failed,
    Skipped,
}

enum CallOutcome {
    Resolved,
    Delegated,
    Skipped,
}

pub struct Orchestrator {
    store: Arc<dyn ChainStore>,
    provider: Arc<dyn Provider>,
    resolver: ToolResolver,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ChainStore>,
        provider: Arc<dyn Provider>,
        resolver: ToolResolver,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            provider,
            resolver,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one full cycle.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport {
            released: self.release_stale_claims().await,
            ..TickReport::default()
        };

        self.dispatch_phase(&mut report).await;
        self.materialize_function_calls().await;
        self.execute_phase(&mut report).await;
        self.fold_phase(&mut report).await;
        self.bubble_phase(&mut report).await;

        if !report.is_idle() {
            debug!(
                released = report.released,
                dispatched = report.dispatched,
                dispatch_failures = report.dispatch_failures,
                executed = report.executed,
                delegated = report.delegated,
                folded = report.folded,
                bubbled = report.bubbled,
                "Tick complete"
            );
        }
        report
    }

    // --- Recovery ---

    async fn release_stale_claims(&self) -> usize {
        let claim_timeout = chrono::Duration::from_std(self.settings.claim_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let cutoff = Utc::now() - claim_timeout;

        match self.store.release_stale_claims(cutoff).await {
            Ok(released) => {
                for chain_id in &released {
                    warn!(chain_id = %chain_id, "Released expired llm_processing claim");
                }
                released.len()
            }
            Err(e) => {
                error!(error = %e, "Failed to release stale claims");
                0
            }
        }
    }

    // --- Phase A: dispatch ---

    async fn dispatch_phase(&self, report: &mut TickReport) {
        let chains = match self.store.dispatchable_chains(Utc::now()).await {
            Ok(chains) => chains,
            Err(e) => {
                error!(error = %e, "Failed to load dispatchable chains");
                return;
            }
        };
        if chains.is_empty() {
            return;
        }

        let outcomes: Vec<DispatchOutcome> = stream::iter(chains)
            .map(|chain| self.dispatch(chain))
            .buffer_unordered(self.settings.max_concurrent_dispatches.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                DispatchOutcome::Recorded => report.dispatched += 1,
                DispatchOutcome::Failed => report.dispatch_failures += 1,
                DispatchOutcome::Skipped => {}
            }
        }
    }

    async fn dispatch(&self, chain: Chain) -> DispatchOutcome {
        let lease = match self.store.claim_chain(chain.id, Utc::now()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(chain_id = %chain.id, "Chain already claimed, skipping");
                return DispatchOutcome::Skipped;
            }
            Err(e) => {
                error!(chain_id = %chain.id, error = %e, "Failed to claim chain");
                return DispatchOutcome::Skipped;
            }
        };

        let started = Instant::now();
        match self.request_completion(&chain).await {
            Ok(message) => {
                let calls = message.tool_calls().len();
                match self.store.record_completion(lease, message).await {
                    Ok(true) => {
                        info!(
                            chain_id = %chain.id,
                            tool_calls = calls,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Completion recorded"
                        );
                        DispatchOutcome::Recorded
                    }
                    Ok(false) => {
                        warn!(chain_id = %chain.id, "Claim lost before the reply was recorded, discarding it");
                        DispatchOutcome::Skipped
                    }
                    Err(e) => {
                        // The claim stays held; it is released once it expires.
                        error!(chain_id = %chain.id, error = %e, "Failed to record completion");
                        DispatchOutcome::Skipped
                    }
                }
            }
            Err(reason) => self.record_failure(&chain, lease, reason).await,
        }
    }

    async fn request_completion(&self, chain: &Chain) -> Result<Message, String> {
        let agent = match self.store.get_agent_by_id(chain.agent_id).await {
            Ok(Some(agent)) => agent,
            Ok(None) => return Err(format!("agent {} not found", chain.agent_id)),
            Err(e) => return Err(e.to_string()),
        };

        let mut request = ProviderRequest::new(&self.settings.model, chain.messages.clone())
            .with_tools(agent.tools)
            .with_temperature(self.settings.temperature);
        if let Some(max_tokens) = self.settings.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        debug!(
            chain_id = %chain.id,
            agent = %agent.name,
            messages = chain.messages.len(),
            "Dispatching chain to completion gateway"
        );

        let timeout = self.settings.completion_timeout;
        match tokio::time::timeout(timeout, self.provider.complete(request)).await {
            Ok(Ok(response)) if response.message.role() == Role::Assistant => Ok(response.message),
            Ok(Ok(response)) => Err(format!(
                "gateway returned a {} message",
                response.message.role()
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("completion timed out after {}s", timeout.as_secs())),
        }
    }

    async fn record_failure(&self, chain: &Chain, lease: Lease, reason: String) -> DispatchOutcome {
        let attempts = chain.dispatch_attempts.saturating_add(1);

        if attempts >= self.settings.max_dispatch_attempts {
            warn!(
                chain_id = %chain.id,
                attempts,
                reason = %reason,
                "Completion failed too many times, stopping chain"
            );
            let message = Message::assistant(format!(
                "error: completion failed after {attempts} attempts: {reason}"
            ));
            if let Err(e) = self.store.record_completion(lease, message).await {
                error!(chain_id = %chain.id, error = %e, "Failed to record exhausted chain");
            }
            return DispatchOutcome::Failed;
        }

        let delay = retry_delay(self.settings.retry_backoff, attempts);
        let retry_after = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300));
        warn!(
            chain_id = %chain.id,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            reason = %reason,
            "Completion failed, will retry"
        );
        if let Err(e) = self.store.record_dispatch_failure(lease, retry_after).await {
            error!(chain_id = %chain.id, error = %e, "Failed to record dispatch failure");
        }
        DispatchOutcome::Failed
    }

    /// Record any tool call of a waiting chain that has no function call row.
    async fn materialize_function_calls(&self) {
        let chains = match self.store.chains_awaiting_function_call().await {
            Ok(chains) => chains,
            Err(e) => {
                error!(error = %e, "Failed to load chains awaiting function calls");
                return;
            }
        };

        for chain in chains {
            for call in chain.pending_tool_calls() {
                match self.store.insert_function_call(chain.id, call).await {
                    Ok(Some(fc)) => warn!(
                        chain_id = %chain.id,
                        function_call_id = %fc.id,
                        function = %fc.function_name,
                        "Recorded missing function call"
                    ),
                    Ok(None) => {}
                    Err(e) => {
                        error!(chain_id = %chain.id, error = %e, "Failed to record function call");
                    }
                }
            }
        }
    }

    // --- Phase B: execute ---

    async fn execute_phase(&self, report: &mut TickReport) {
        let calls = match self.store.unclaimed_function_calls().await {
            Ok(calls) => calls,
            Err(e) => {
                error!(error = %e, "Failed to load unclaimed function calls");
                return;
            }
        };

        for call in calls {
            let (chain_id, call_id) = (call.chain_id, call.id);
            match self.execute(call).await {
                Ok(CallOutcome::Resolved) => report.executed += 1,
                Ok(CallOutcome::Delegated) => report.delegated += 1,
                Ok(CallOutcome::Skipped) => {}
                Err(e) => error!(
                    chain_id = %chain_id,
                    function_call_id = %call_id,
                    error = %e,
                    "Failed to execute function call"
                ),
            }
        }
    }

    async fn execute(&self, call: FunctionCall) -> Result<CallOutcome, StoreError> {
        match self.resolver.resolve(&call.function_name) {
            Resolution::Local(tool) => {
                let result = match call.parsed_arguments() {
                    Ok(arguments) => match tool.execute(arguments).await {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(
                                function_call_id = %call.id,
                                function = %call.function_name,
                                error = %e,
                                "Tool failed"
                            );
                            error_result(e)
                        }
                    },
                    Err(e) => error_result(e),
                };
                self.resolve_call(&call, result).await
            }
            Resolution::Delegate(target) => self.delegate(&call, &target).await,
            Resolution::Unknown => {
                warn!(
                    chain_id = %call.chain_id,
                    function = %call.function_name,
                    "Model requested an unknown function"
                );
                let result = error_result(ToolError::NotFound(call.function_name.clone()));
                self.resolve_call(&call, result).await
            }
        }
    }

    async fn resolve_call(
        &self,
        call: &FunctionCall,
        result: serde_json::Value,
    ) -> Result<CallOutcome, StoreError> {
        if self.store.set_function_call_result(call.id, &result).await? {
            debug!(
                chain_id = %call.chain_id,
                function_call_id = %call.id,
                function = %call.function_name,
                "Function call resolved"
            );
            Ok(CallOutcome::Resolved)
        } else {
            Ok(CallOutcome::Skipped)
        }
    }

    async fn delegate(&self, call: &FunctionCall, target: &str) -> Result<CallOutcome, StoreError> {
        let Some(agent) = self.store.get_agent(target).await? else {
            warn!(chain_id = %call.chain_id, agent = %target, "Delegation to unknown agent");
            let result = error_result(Error::DelegationTargetNotFound(target.to_string()));
            return self.resolve_call(call, result).await;
        };

        let limit = self.settings.max_delegation_depth;
        if self.depth_of(call.chain_id).await? >= limit {
            warn!(chain_id = %call.chain_id, agent = %target, limit, "Delegation depth limit reached");
            let result = error_result(format!("delegation depth limit of {limit} reached"));
            return self.resolve_call(call, result).await;
        }

        let message = match call.parsed_arguments() {
            Ok(arguments) => match arguments.get("message") {
                Some(serde_json::Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => {
                    let e = ToolError::InvalidArguments(format!(
                        "{}: missing 'message'",
                        call.function_name
                    ));
                    return self.resolve_call(call, error_result(e)).await;
                }
            },
            Err(e) => return self.resolve_call(call, error_result(e)).await,
        };

        let child = NewChain::delegated(agent.id, &agent.system_prompt, message, call.id);
        match self.store.attach_child_chain(call.id, child).await? {
            Some(child) => {
                info!(
                    chain_id = %call.chain_id,
                    function_call_id = %call.id,
                    child_chain_id = %child.id,
                    agent = %agent.name,
                    "Delegated to child chain"
                );
                Ok(CallOutcome::Delegated)
            }
            None => Ok(CallOutcome::Skipped),
        }
    }

    /// Number of delegation hops between `chain_id` and its root.
    async fn depth_of(&self, chain_id: ChainId) -> Result<usize, StoreError> {
        let mut depth = 0;
        let mut current = self.store.get_chain(chain_id).await?;

        while let Some(parent_call) = current.and_then(|c| c.parent_function_call_id) {
            depth += 1;
            if depth > self.settings.max_delegation_depth {
                break;
            }
            current = match self.store.get_function_call(parent_call).await? {
                Some(call) => self.store.get_chain(call.chain_id).await?,
                None => None,
            };
        }
        Ok(depth)
    }

    // --- Phase C: fold ---

    async fn fold_phase(&self, report: &mut TickReport) {
        let ready = match self.store.chains_ready_for_fold().await {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "Failed to load chains ready for fold");
                return;
            }
        };

        for chain_id in ready {
            match self.store.fold_results(chain_id).await {
                Ok(0) => debug!(chain_id = %chain_id, "Chain no longer ready for fold"),
                Ok(folded) => {
                    info!(chain_id = %chain_id, results = folded, "Folded function call results");
                    report.folded += 1;
                }
                Err(e) => error!(
                    chain_id = %chain_id,
                    error = %e,
                    "Failed to fold results, will retry next tick"
                ),
            }
        }
    }

    // --- Phase D: bubble ---

    async fn bubble_phase(&self, report: &mut TickReport) {
        let children = match self.store.completed_children_awaiting_bubble().await {
            Ok(children) => children,
            Err(e) => {
                error!(error = %e, "Failed to load completed child chains");
                return;
            }
        };

        for child in children {
            let Some(parent_call) = child.parent_function_call_id else {
                continue;
            };
            let Some(answer) = child.last_message().filter(|m| m.is_final_answer()) else {
                debug!(chain_id = %child.id, "Child stopped without a final answer");
                continue;
            };
            let result = serde_json::Value::String(answer.content().unwrap_or_default().to_string());

            match self.store.set_function_call_result(parent_call, &result).await {
                Ok(true) => {
                    info!(
                        chain_id = %child.id,
                        function_call_id = %parent_call,
                        "Child answer propagated to parent call"
                    );
                    report.bubbled += 1;
                }
                Ok(false) => {}
                Err(e) => error!(
                    chain_id = %child.id,
                    function_call_id = %parent_call,
                    error = %e,
                    "Failed to propagate child answer"
                ),
            }
        }
    }
}
