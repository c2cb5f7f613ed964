//! The chain orchestration engine.
//!
//! - [`AgentRegistry`]: agent catalog built from config and persisted at startup
//! - [`ToolResolver`]: classifies a requested function name
//! - [`Orchestrator`]: one four-phase tick over the entity store
//! - [`Scheduler`]: drives ticks on a fixed cadence until cancelled
//! - [`ChainService`]: the entry points used by the HTTP API and the CLI

pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod testing;

pub use orchestrator::{Orchestrator, OrchestratorSettings, TickReport, retry_delay};
pub use registry::AgentRegistry;
pub use resolver::{Resolution, ToolResolver};
pub use scheduler::Scheduler;
pub use service::ChainService;
