//! Completion gateway implementations for agentchain.
//!
//! Every backend implements `agentchain_core::Provider`. The router picks
//! one from configuration.

pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::{ProviderRouter, build_from_config, dispatch_model};
