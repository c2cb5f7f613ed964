//! Scheduler: drives [`Orchestrator::tick`] on a fixed cadence.
//!
//! Ticks run inline in the loop, so they never overlap; a tick that
//! overruns the interval delays the next one instead of bunching up.
//! Cancelling the shutdown token stops the loop after the in-flight tick.

use crate::orchestrator::{Orchestrator, TickReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    tick_interval: Duration,
    shutdown_token: CancellationToken,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, tick_interval: Duration) -> Self {
        Self {
            orchestrator,
            tick_interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Stop when `token` (or a parent of it) is cancelled.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn the loop on the runtime.
    pub fn start(self) -> JoinHandle<TickReport> {
        tokio::spawn(async move { self.run().await })
    }

    /// Tick until shutdown. Returns the summed report of every tick.
    pub async fn run(&self) -> TickReport {
        info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Starting chain scheduler"
        );

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = TickReport::default();
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping chain scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.orchestrator.tick().await;
                    ticks += 1;
                    accumulate(&mut total, report);
                }
            }
        }

        debug!(ticks, "Chain scheduler stopped");
        total
    }
}

fn accumulate(total: &mut TickReport, report: TickReport) {
    total.released += report.released;
    total.dispatched += report.dispatched;
    total.dispatch_failures += report.dispatch_failures;
    total.executed += report.executed;
    total.delegated += report.delegated;
    total.folded += report.folded;
    total.bubbled += report.bubbled;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use agentchain_core::chain::ChainStatus;
    use agentchain_core::store::ChainStore;
    use agentchain_store::InMemoryStore;

    #[tokio::test(start_paused = true)]
    async fn drives_chains_until_cancelled() {
        let store: Arc<dyn ChainStore> = Arc::new(InMemoryStore::new());
        let orch = Arc::new(orchestrator(store.clone(), arithmetic_gateway()).await);
        let root = root_chain(&store, "project_manager", "what is (2+5) + (3+4)?").await;

        let scheduler = Scheduler::new(orch, Duration::from_millis(100));
        let token = scheduler.shutdown_token();
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();
        let total = handle.await.unwrap();

        let done = store.get_chain(root.id).await.unwrap().unwrap();
        assert_eq!(done.status, ChainStatus::StopAwaitingUser);
        assert_eq!(done.final_answer(), Some("14"));
        assert_eq!(total.delegated, 2);
        assert_eq!(total.bubbled, 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_exits_immediately() {
        let store: Arc<dyn ChainStore> = Arc::new(InMemoryStore::new());
        let orch = Arc::new(orchestrator(store, arithmetic_gateway()).await);

        let parent = CancellationToken::new();
        let scheduler = Scheduler::new(orch, Duration::from_secs(60))
            .with_shutdown_token(parent.child_token());
        parent.cancel();

        let total = scheduler.start().await.unwrap();
        assert!(total.is_idle());
    }

    #[test]
    fn reports_accumulate() {
        let mut total = TickReport::default();
        let one = TickReport {
            dispatched: 2,
            folded: 1,
            ..TickReport::default()
        };
        accumulate(&mut total, one);
        accumulate(&mut total, one);
        assert_eq!(total.dispatched, 4);
        assert_eq!(total.folded, 2);
    }
}
