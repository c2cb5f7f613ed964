//! `agentchain serve`: scheduler plus HTTP API.

use super::{CommandResult, Runtime, cancel_on_ctrl_c, load_config};

pub async fn run(port_override: Option<u16>) -> CommandResult {
    let mut config = load_config()?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let runtime = Runtime::build(&config).await?;
    let shutdown = runtime.scheduler.shutdown_token();
    cancel_on_ctrl_c(shutdown.clone());

    println!("🔗 agentchain");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Store: {} ({})", config.store.backend, config.store.path);
    println!(
        "   Tick interval: {}ms",
        config.orchestrator.tick_interval_ms
    );

    let scheduler = runtime.scheduler.start();
    let served = agentchain_gateway::start(&config.gateway, runtime.service, shutdown.clone()).await;

    // Stop the scheduler even if the server failed to bind.
    shutdown.cancel();
    let report = scheduler.await?;
    tracing::info!(?report, "Scheduler totals");

    served
}
