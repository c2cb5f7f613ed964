//! Scripted gateways and fixtures shared by the unit tests.

use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::registry::AgentRegistry;
use crate::resolver::ToolResolver;
use agentchain_config::default_agents;
use agentchain_core::agent::{AgentDefinition, AgentRecord};
use agentchain_core::chain::{
    AgentId, Chain, ChainId, ChainStatus, ChainSummary, FunctionCall, FunctionCallId, Lease,
    NewChain,
};
use agentchain_core::error::{ProviderError, StoreError};
use agentchain_core::message::{Message, MessageToolCall};
use agentchain_core::provider::{Provider, ProviderRequest, ProviderResponse};
use agentchain_core::store::ChainStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn respond(message: Message) -> ProviderResponse {
    ProviderResponse {
        message,
        usage: None,
        model: "mock-model".into(),
    }
}

/// A gateway that answers by calling a closure on each request.
pub struct FnProvider<F> {
    respond: F,
    calls: AtomicUsize,
}

impl<F> FnProvider<F>
where
    F: Fn(&ProviderRequest) -> Result<Message, ProviderError> + Send + Sync + 'static,
{
    pub fn new(respond: F) -> Arc<Self> {
        Arc::new(Self {
            respond,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Provider for FnProvider<F>
where
    F: Fn(&ProviderRequest) -> Result<Message, ProviderError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "fn-mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(&request).map(respond)
    }
}

/// A gateway that replays a fixed list of replies, then fails.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<Message, ProviderError>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<Message, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ProviderError::InvalidResponse("script exhausted".into())))
            .map(respond)
    }
}

/// A gateway that never answers.
pub struct StalledProvider;

#[async_trait]
impl Provider for StalledProvider {
    fn name(&self) -> &str {
        "stalled-mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ProviderError::Timeout("never answers".into()))
    }
}

/// An assistant message requesting `(id, function, arguments)` calls.
pub fn asking(calls: &[(&str, &str, &str)]) -> Message {
    Message::assistant_with_tool_calls(
        None,
        calls
            .iter()
            .map(|(id, name, args)| MessageToolCall::new(*id, *name, *args))
            .collect(),
    )
}

/// `"compute 2+5"` → `(2, 5)`
fn operands(text: &str) -> Option<(i64, i64)> {
    let expr = text.strip_prefix("compute ")?;
    let (x, y) = expr.split_once('+')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Plays both default agents.
///
/// The calculator operator turns `compute a+b` into an `add` call and
/// repeats the tool output as its answer. The project manager delegates
/// `compute 2+5` and `compute 3+4`, then answers with the sum of the
/// results it got back.
pub fn arithmetic_gateway()
-> Arc<FnProvider<impl Fn(&ProviderRequest) -> Result<Message, ProviderError> + Send + Sync + 'static>>
{
    FnProvider::new(|req: &ProviderRequest| {
        let system = req.messages.first().and_then(|m| m.content()).unwrap_or_default();
        let last = req.messages.last();

        if system.starts_with("You are a skilled calculator operator") {
            return match last {
                Some(Message::User { content }) => {
                    let (x, y) = operands(content)
                        .ok_or_else(|| ProviderError::InvalidResponse(format!("cannot parse {content}")))?;
                    let args = serde_json::json!({ "x": x, "y": y }).to_string();
                    Ok(asking(&[("call_add", "add", args.as_str())]))
                }
                Some(Message::Tool { content, .. }) => Ok(Message::assistant(content.clone())),
                _ => Err(ProviderError::InvalidResponse("unexpected history".into())),
            };
        }

        match last {
            Some(Message::User { .. }) => Ok(asking(&[
                ("call_1", "delegate_to_calculator_operator", r#"{"message":"compute 2+5"}"#),
                ("call_2", "delegate_to_calculator_operator", r#"{"message":"compute 3+4"}"#),
            ])),
            Some(Message::Tool { .. }) => {
                let total: f64 = req
                    .messages
                    .iter()
                    .filter_map(|m| match m {
                        Message::Tool { content, .. } => content.parse::<f64>().ok(),
                        _ => None,
                    })
                    .sum();
                Ok(Message::assistant(total.to_string()))
            }
            _ => Err(ProviderError::InvalidResponse("unexpected history".into())),
        }
    })
}

pub async fn orchestrator(store: Arc<dyn ChainStore>, provider: Arc<dyn Provider>) -> Orchestrator {
    orchestrator_with(store, provider, OrchestratorSettings::default()).await
}

/// An orchestrator over `store` with the default agents registered.
pub async fn orchestrator_with(
    store: Arc<dyn ChainStore>,
    provider: Arc<dyn Provider>,
    settings: OrchestratorSettings,
) -> Orchestrator {
    let tools = agentchain_tools::default_registry();
    AgentRegistry::from_config(&default_agents(), &tools)
        .unwrap()
        .persist(store.as_ref())
        .await
        .unwrap();
    Orchestrator::new(store, provider, ToolResolver::new(tools), settings)
}

pub async fn root_chain(store: &Arc<dyn ChainStore>, agent: &str, user_message: &str) -> Chain {
    let agent = store.get_agent(agent).await.unwrap().unwrap();
    store
        .insert_chain(NewChain::root(agent.id, agent.system_prompt, user_message))
        .await
        .unwrap()
}

/// Tick until `chain_id` stops, panicking after `max_ticks`.
pub async fn tick_until_stopped(orch: &Orchestrator, chain_id: ChainId, max_ticks: usize) -> Chain {
    for _ in 0..max_ticks {
        orch.tick().await;
        let chain = orch.store().get_chain(chain_id).await.unwrap().unwrap();
        if chain.status.is_terminal() {
            return chain;
        }
    }
    panic!("chain {chain_id} did not stop within {max_ticks} ticks");
}

/// Delegates to an inner store but fails the first `failures` folds.
pub struct FailingFold {
    inner: Arc<dyn ChainStore>,
    failures: AtomicUsize,
}

impl FailingFold {
    pub fn new(inner: Arc<dyn ChainStore>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ChainStore for FailingFold {
    fn name(&self) -> &str {
        "failing-fold"
    }

    async fn upsert_agent(&self, agent: &AgentDefinition) -> Result<AgentRecord, StoreError> {
        self.inner.upsert_agent(agent).await
    }

    async fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, StoreError> {
        self.inner.get_agent(name).await
    }

    async fn get_agent_by_id(&self, id: AgentId) -> Result<Option<AgentRecord>, StoreError> {
        self.inner.get_agent_by_id(id).await
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        self.inner.list_agents().await
    }

    async fn insert_chain(&self, chain: NewChain) -> Result<Chain, StoreError> {
        self.inner.insert_chain(chain).await
    }

    async fn get_chain(&self, id: ChainId) -> Result<Option<Chain>, StoreError> {
        self.inner.get_chain(id).await
    }

    async fn update_chain_status(&self, id: ChainId, status: ChainStatus) -> Result<bool, StoreError> {
        self.inner.update_chain_status(id, status).await
    }

    async fn list_chains(&self) -> Result<Vec<ChainSummary>, StoreError> {
        self.inner.list_chains().await
    }

    async fn dispatchable_chains(&self, now: DateTime<Utc>) -> Result<Vec<Chain>, StoreError> {
        self.inner.dispatchable_chains(now).await
    }

    async fn claim_chain(&self, id: ChainId, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError> {
        self.inner.claim_chain(id, now).await
    }

    async fn record_completion(&self, lease: Lease, message: Message) -> Result<bool, StoreError> {
        self.inner.record_completion(lease, message).await
    }

    async fn record_dispatch_failure(
        &self,
        lease: Lease,
        retry_after: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.record_dispatch_failure(lease, retry_after).await
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChainId>, StoreError> {
        self.inner.release_stale_claims(cutoff).await
    }

    async fn chains_awaiting_function_call(&self) -> Result<Vec<Chain>, StoreError> {
        self.inner.chains_awaiting_function_call().await
    }

    async fn insert_function_call(
        &self,
        chain_id: ChainId,
        call: &MessageToolCall,
    ) -> Result<Option<FunctionCall>, StoreError> {
        self.inner.insert_function_call(chain_id, call).await
    }

    async fn get_function_call(&self, id: FunctionCallId) -> Result<Option<FunctionCall>, StoreError> {
        self.inner.get_function_call(id).await
    }

    async fn function_calls_for_chain(&self, chain_id: ChainId) -> Result<Vec<FunctionCall>, StoreError> {
        self.inner.function_calls_for_chain(chain_id).await
    }

    async fn unclaimed_function_calls(&self) -> Result<Vec<FunctionCall>, StoreError> {
        self.inner.unclaimed_function_calls().await
    }

    async fn set_function_call_result(
        &self,
        id: FunctionCallId,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.inner.set_function_call_result(id, result).await
    }

    async fn attach_child_chain(
        &self,
        id: FunctionCallId,
        child: NewChain,
    ) -> Result<Option<Chain>, StoreError> {
        self.inner.attach_child_chain(id, child).await
    }

    async fn chains_ready_for_fold(&self) -> Result<Vec<ChainId>, StoreError> {
        self.inner.chains_ready_for_fold().await
    }

    async fn fold_results(&self, chain_id: ChainId) -> Result<usize, StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::TransactionFailed("injected fold failure".into()));
        }
        self.inner.fold_results(chain_id).await
    }

    async fn completed_children_awaiting_bubble(&self) -> Result<Vec<Chain>, StoreError> {
        self.inner.completed_children_awaiting_bubble().await
    }
}
