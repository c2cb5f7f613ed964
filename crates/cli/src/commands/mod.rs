//! CLI subcommands and the wiring they share.

pub mod agents;
pub mod chains;
pub mod onboard;
pub mod run;
pub mod serve;
pub mod worker;

use agentchain_config::AppConfig;
use agentchain_core::store::ChainStore;
use agentchain_orchestrator::{
    AgentRegistry, ChainService, Orchestrator, OrchestratorSettings, Scheduler, ToolResolver,
};
use std::sync::Arc;
use tracing::info;

pub(crate) type CommandResult = Result<(), Box<dyn std::error::Error>>;

pub(crate) fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Open the configured store, creating the config dir for relative SQLite paths.
pub(crate) async fn open_store(
    config: &AppConfig,
) -> Result<Arc<dyn ChainStore>, Box<dyn std::error::Error>> {
    if config.store.backend == "sqlite" {
        std::fs::create_dir_all(AppConfig::config_dir())?;
    }
    let store = agentchain_store::open(&config.store.backend, &config.store.database_url()).await?;
    info!(backend = store.name(), "Store opened");
    Ok(store)
}

/// Everything a scheduler-running command needs.
pub(crate) struct Runtime {
    pub service: ChainService,
    pub scheduler: Scheduler,
}

impl Runtime {
    /// Open the store, persist the agent catalog and build the scheduler.
    pub async fn build(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let store = open_store(config).await?;

        let tools = agentchain_tools::default_registry();
        AgentRegistry::from_config(&config.agents, &tools)?
            .persist(store.as_ref())
            .await?;

        let router = agentchain_providers::build_from_config(config);
        let provider = router
            .default()
            .ok_or("No default provider configured, set an API key")?;

        let settings = OrchestratorSettings::from_config(config)
            .with_model(agentchain_providers::dispatch_model(config));
        info!(
            provider = provider.name(),
            model = %settings.model,
            "Orchestrator configured"
        );

        let orchestrator = Orchestrator::new(
            store.clone(),
            provider,
            ToolResolver::new(tools),
            settings,
        );
        let scheduler = Scheduler::new(
            Arc::new(orchestrator),
            config.orchestrator.tick_interval(),
        );

        Ok(Self {
            service: ChainService::new(store),
            scheduler,
        })
    }
}

/// Cancel `token` when Ctrl+C is pressed.
pub(crate) fn cancel_on_ctrl_c(token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
        }
        token.cancel();
    });
}
