//! `agentchain run`: start one root chain and wait for its answer.

use super::{CommandResult, Runtime, load_config};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub async fn run(agent: &str, message: &str, timeout_secs: u64) -> CommandResult {
    let config = load_config()?;
    let runtime = Runtime::build(&config).await?;
    let shutdown = runtime.scheduler.shutdown_token();

    let chain = runtime.service.create_chain(agent, message).await?;
    println!("🔗 Chain {} started for {agent}", chain.id);

    let scheduler = runtime.scheduler.start();
    let outcome = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        runtime.service.wait_until_stopped(chain.id, POLL_INTERVAL),
    )
    .await;

    shutdown.cancel();
    scheduler.await?;

    let done = outcome
        .map_err(|_| format!("chain {} did not finish within {timeout_secs}s", chain.id))??;
    match done.final_answer() {
        Some(answer) => println!("{answer}"),
        None => println!("(chain {} stopped without an answer)", done.id),
    }
    Ok(())
}
