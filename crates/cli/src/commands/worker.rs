//! `agentchain worker`: run the scheduler without the HTTP API.

use super::{CommandResult, Runtime, cancel_on_ctrl_c, load_config};

pub async fn run() -> CommandResult {
    let config = load_config()?;
    let runtime = Runtime::build(&config).await?;
    cancel_on_ctrl_c(runtime.scheduler.shutdown_token());

    println!("🔗 agentchain worker");
    println!("   Store: {} ({})", config.store.backend, config.store.path);
    println!("   Press Ctrl+C to stop.");

    let report = runtime.scheduler.run().await;
    println!(
        "\n✅ Stopped: {} dispatched, {} calls executed, {} delegated, {} folded",
        report.dispatched, report.executed, report.delegated, report.folded
    );
    Ok(())
}
