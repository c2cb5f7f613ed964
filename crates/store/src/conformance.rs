//! Behavioural checks shared by every [`ChainStore`] backend.
//!
//! Each backend's test module calls these against a fresh store.

use agentchain_core::agent::{AgentDefinition, AgentRecord};
use agentchain_core::chain::{Chain, ChainId, ChainStatus, FunctionCallId, NewChain};
use agentchain_core::message::{Message, MessageToolCall};
use agentchain_core::store::ChainStore;
use chrono::{Duration, Utc};
use serde_json::json;

fn calculator() -> AgentDefinition {
    AgentDefinition::new("calculator_operator", "You are a skilled calculator operator")
}

async fn seeded(store: &impl ChainStore) -> (AgentRecord, Chain) {
    let agent = store.upsert_agent(&calculator()).await.unwrap();
    let chain = store
        .insert_chain(NewChain::root(agent.id, calculator().system_prompt, "what is 2+5?"))
        .await
        .unwrap();
    (agent, chain)
}

fn asking(calls: &[(&str, &str)]) -> Message {
    Message::assistant_with_tool_calls(
        None,
        calls
            .iter()
            .map(|(id, name)| MessageToolCall::new(*id, *name, r#"{"x":2,"y":5}"#))
            .collect(),
    )
}

/// Claim `chain_id` and record `reply` as the model's answer.
async fn complete_with(store: &impl ChainStore, chain_id: ChainId, reply: Message) {
    let lease = store.claim_chain(chain_id, Utc::now()).await.unwrap().unwrap();
    assert!(store.record_completion(lease, reply).await.unwrap());
}

pub async fn agent_upsert_is_keyed_by_name(store: &impl ChainStore) {
    let first = store.upsert_agent(&calculator()).await.unwrap();
    assert_eq!(first.delegation_tool_name, "delegate_to_calculator_operator");
    assert_eq!(first.delegation_tool_description, "delegate to calculator_operator");

    let revised = AgentDefinition::new("calculator_operator", "You add things")
        .with_delegation_description("adds numbers");
    let second = store.upsert_agent(&revised).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.system_prompt, "You add things");
    assert_eq!(second.delegation_tool_description, "adds numbers");

    assert_eq!(store.list_agents().await.unwrap().len(), 1);
    assert!(store.get_agent("calculator_operator").await.unwrap().is_some());
    assert!(store.get_agent("ghost").await.unwrap().is_none());
    let by_id = store.get_agent_by_id(first.id).await.unwrap().unwrap();
    assert_eq!(by_id.name, "calculator_operator");
}

pub async fn chain_insert_and_fetch(store: &impl ChainStore) {
    let (agent, chain) = seeded(store).await;
    assert_eq!(chain.status, ChainStatus::AwaitingLlmProcessing);
    assert_eq!(chain.agent_id, agent.id);
    assert_eq!(chain.messages[0], Message::system("You are a skilled calculator operator"));
    assert_eq!(chain.messages[1], Message::user("what is 2+5?"));

    let second = store
        .insert_chain(NewChain::root(agent.id, calculator().system_prompt, "and 3+4?"))
        .await
        .unwrap();
    assert!(second.id > chain.id);

    let fetched = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(fetched.messages, chain.messages);
    assert!(store.get_chain(ChainId(9_999)).await.unwrap().is_none());
}

pub async fn duplicate_function_calls_collapse(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    let call = MessageToolCall::new("call_1", "add", r#"{"x":2,"y":5}"#);

    let first = store.insert_function_call(chain.id, &call).await.unwrap();
    assert!(first.is_some());
    let again = store.insert_function_call(chain.id, &call).await.unwrap();
    assert!(again.is_none());

    let calls = store.function_calls_for_chain(chain.id).await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments, r#"{"x":2,"y":5}"#);
}

pub async fn claim_is_single_flight(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    let now = Utc::now();
    assert_eq!(store.dispatchable_chains(now).await.unwrap().len(), 1);

    let lease = store.claim_chain(chain.id, now).await.unwrap();
    assert!(lease.is_some());
    assert!(store.claim_chain(chain.id, now).await.unwrap().is_none());

    let claimed = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, ChainStatus::LlmProcessing);
    assert!(claimed.claimed_at.is_some());
    assert!(store.dispatchable_chains(now).await.unwrap().is_empty());
}

pub async fn completion_records_reply_and_calls(store: &impl ChainStore) {
    let (agent, chain) = seeded(store).await;
    complete_with(store, chain.id, asking(&[("c1", "add"), ("c2", "add")])).await;

    let updated = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(updated.status, ChainStatus::AwaitingFunctionCall);
    assert_eq!(updated.messages.len(), 3);
    assert!(updated.claimed_at.is_none());
    assert_eq!(store.function_calls_for_chain(chain.id).await.unwrap().len(), 2);
    assert_eq!(store.unclaimed_function_calls().await.unwrap().len(), 2);
    assert_eq!(store.chains_awaiting_function_call().await.unwrap().len(), 1);

    let other = store
        .insert_chain(NewChain::root(agent.id, calculator().system_prompt, "hello"))
        .await
        .unwrap();
    complete_with(store, other.id, Message::assistant("hi")).await;
    let done = store.get_chain(other.id).await.unwrap().unwrap();
    assert_eq!(done.status, ChainStatus::StopAwaitingUser);
    assert_eq!(done.final_answer(), Some("hi"));
}

pub async fn stale_lease_cannot_complete(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    let first = store.claim_chain(chain.id, Utc::now()).await.unwrap().unwrap();

    let released = store
        .release_stale_claims(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(released, vec![chain.id]);

    let second = store.claim_chain(chain.id, Utc::now()).await.unwrap().unwrap();
    assert_ne!(first.epoch, second.epoch);

    assert!(!store.record_completion(first, Message::assistant("late")).await.unwrap());
    assert!(store.record_completion(second, Message::assistant("7")).await.unwrap());

    let done = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(done.messages.len(), 3);
    assert_eq!(done.final_answer(), Some("7"));
}

pub async fn dispatch_failure_defers_chain(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    let now = Utc::now();
    let lease = store.claim_chain(chain.id, now).await.unwrap().unwrap();

    let retry_at = now + Duration::seconds(60);
    assert!(store.record_dispatch_failure(lease, retry_at).await.unwrap());

    let failed = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ChainStatus::AwaitingLlmProcessing);
    assert_eq!(failed.dispatch_attempts, 1);
    assert!(store.dispatchable_chains(now).await.unwrap().is_empty());
    assert_eq!(
        store
            .dispatchable_chains(now + Duration::seconds(61))
            .await
            .unwrap()
            .len(),
        1
    );

    // The failed attempt's lease is spent.
    assert!(!store.record_completion(lease, Message::assistant("x")).await.unwrap());

    let retry = store.claim_chain(chain.id, now).await.unwrap().unwrap();
    assert!(store.record_completion(retry, Message::assistant("ok")).await.unwrap());
    let done = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(done.dispatch_attempts, 0);
    assert!(done.retry_after.is_none());
}

pub async fn result_is_written_once(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    let fc = store
        .insert_function_call(chain.id, &MessageToolCall::new("c1", "add", "{}"))
        .await
        .unwrap()
        .unwrap();

    assert!(store.set_function_call_result(fc.id, &json!(7)).await.unwrap());
    assert!(!store.set_function_call_result(fc.id, &json!(8)).await.unwrap());

    let stored = store.get_function_call(fc.id).await.unwrap().unwrap();
    assert_eq!(stored.result, Some(json!(7)));
    assert!(store.unclaimed_function_calls().await.unwrap().is_empty());
    assert!(!store
        .set_function_call_result(FunctionCallId(9_999), &json!(1))
        .await
        .unwrap());
}

pub async fn child_chain_attaches_once(store: &impl ChainStore) {
    let (agent, chain) = seeded(store).await;
    complete_with(store, chain.id, asking(&[("call_d", "delegate_to_calculator_operator")])).await;
    let fc = store.function_calls_for_chain(chain.id).await.unwrap().remove(0);

    let child = NewChain::delegated(agent.id, "calc", "compute 2+5", fc.id);
    let created = store.attach_child_chain(fc.id, child.clone()).await.unwrap().unwrap();
    assert_eq!(created.parent_function_call_id, Some(fc.id));
    assert_eq!(created.status, ChainStatus::AwaitingLlmProcessing);

    assert!(store.attach_child_chain(fc.id, child).await.unwrap().is_none());

    let stored = store.get_function_call(fc.id).await.unwrap().unwrap();
    assert_eq!(stored.child_chain_id, Some(created.id));
    assert!(stored.result.is_none());
    assert!(store.unclaimed_function_calls().await.unwrap().is_empty());
}

pub async fn fold_waits_for_every_result(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    complete_with(store, chain.id, asking(&[("c1", "add"), ("c2", "add")])).await;
    let calls = store.function_calls_for_chain(chain.id).await.unwrap();

    store.set_function_call_result(calls[0].id, &json!(7)).await.unwrap();
    assert!(store.chains_ready_for_fold().await.unwrap().is_empty());
    assert_eq!(store.fold_results(chain.id).await.unwrap(), 0);

    store.set_function_call_result(calls[1].id, &json!("seven")).await.unwrap();
    assert_eq!(store.chains_ready_for_fold().await.unwrap(), vec![chain.id]);
    assert_eq!(store.fold_results(chain.id).await.unwrap(), 2);

    let folded = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(folded.status, ChainStatus::AwaitingLlmProcessing);
    assert_eq!(folded.messages.len(), 5);
    assert_eq!(folded.messages[3], Message::tool_result("c1", "add", "7"));
    assert_eq!(folded.messages[4], Message::tool_result("c2", "add", "seven"));

    let calls = store.function_calls_for_chain(chain.id).await.unwrap();
    assert!(calls.iter().all(|fc| fc.added_to_chain_at.is_some()));
    assert!(store.chains_ready_for_fold().await.unwrap().is_empty());
    assert_eq!(store.fold_results(chain.id).await.unwrap(), 0);
}

pub async fn reused_call_id_is_answered_with_error(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    complete_with(store, chain.id, asking(&[("c1", "add")])).await;
    let first = store.function_calls_for_chain(chain.id).await.unwrap().remove(0);
    store.set_function_call_result(first.id, &json!(7)).await.unwrap();
    assert_eq!(store.fold_results(chain.id).await.unwrap(), 1);

    // Same id on the next turn.
    complete_with(store, chain.id, asking(&[("c1", "add")])).await;
    assert!(store.unclaimed_function_calls().await.unwrap().is_empty());
    assert_eq!(store.chains_ready_for_fold().await.unwrap(), vec![chain.id]);
    assert_eq!(store.fold_results(chain.id).await.unwrap(), 1);

    let folded = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(folded.status, ChainStatus::AwaitingLlmProcessing);
    assert_eq!(folded.messages.len(), 6);
    assert_eq!(folded.messages[3], Message::tool_result("c1", "add", "7"));
    assert_eq!(
        folded.messages[5],
        Message::tool_result("c1", "add", r#"{"error":"duplicate tool call id c1"}"#)
    );

    let calls = store.function_calls_for_chain(chain.id).await.unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].added_to_chain_at.is_some());
}

pub async fn fold_appends_in_invocation_order(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    // "a" gets the lower id even though the model lists it second.
    store
        .insert_function_call(chain.id, &MessageToolCall::new("a", "add", "{}"))
        .await
        .unwrap();
    complete_with(store, chain.id, asking(&[("b", "add"), ("a", "add")])).await;

    for fc in store.function_calls_for_chain(chain.id).await.unwrap() {
        let value = json!(fc.external_id.clone());
        store.set_function_call_result(fc.id, &value).await.unwrap();
    }
    assert_eq!(store.fold_results(chain.id).await.unwrap(), 2);

    let folded = store.get_chain(chain.id).await.unwrap().unwrap();
    let order: Vec<&str> = folded.messages[3..]
        .iter()
        .filter_map(|m| m.content())
        .collect();
    assert_eq!(order, vec!["b", "a"]);
}

pub async fn bubble_candidates_and_listing(store: &impl ChainStore) {
    let (agent, parent) = seeded(store).await;
    complete_with(store, parent.id, asking(&[("call_d", "delegate_to_calculator_operator")])).await;
    let fc = store.function_calls_for_chain(parent.id).await.unwrap().remove(0);

    let child = store
        .attach_child_chain(fc.id, NewChain::delegated(agent.id, "calc", "compute 2+5", fc.id))
        .await
        .unwrap()
        .unwrap();
    assert!(store.completed_children_awaiting_bubble().await.unwrap().is_empty());

    complete_with(store, child.id, Message::assistant("7")).await;
    let waiting = store.completed_children_awaiting_bubble().await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, child.id);

    let listing = store.list_chains().await.unwrap();
    assert_eq!(listing.len(), 2);
    assert_eq!(listing[0].id, parent.id);
    assert!(listing[0].parent_chain_id.is_none());
    assert_eq!(listing[1].agent_name, "calculator_operator");
    assert_eq!(listing[1].parent_chain_id, Some(parent.id));
    assert_eq!(listing[1].parent_external_function_call_id.as_deref(), Some("call_d"));

    store.set_function_call_result(fc.id, &json!("7")).await.unwrap();
    assert!(store.completed_children_awaiting_bubble().await.unwrap().is_empty());
}

pub async fn update_status_sets_claim_time(store: &impl ChainStore) {
    let (_, chain) = seeded(store).await;
    assert!(store.update_chain_status(chain.id, ChainStatus::LlmProcessing).await.unwrap());
    let claimed = store.get_chain(chain.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, ChainStatus::LlmProcessing);
    assert!(claimed.claimed_at.is_some());

    assert!(store.update_chain_status(chain.id, ChainStatus::StopAwaitingUser).await.unwrap());
    let stopped = store.get_chain(chain.id).await.unwrap().unwrap();
    assert!(stopped.status.is_terminal());
    assert!(stopped.claimed_at.is_none());

    assert!(!store
        .update_chain_status(ChainId(9_999), ChainStatus::StopAwaitingUser)
        .await
        .unwrap());
}
