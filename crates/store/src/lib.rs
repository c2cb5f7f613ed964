//! Entity store backends for agentchain.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
mod conformance;

use agentchain_core::error::StoreError;
use agentchain_core::store::ChainStore;
use std::sync::Arc;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Open the backend named by `backend` (`sqlite` or `memory`).
pub async fn open(backend: &str, database_url: &str) -> Result<Arc<dyn ChainStore>, StoreError> {
    match backend {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => Ok(Arc::new(SqliteStore::connect(database_url).await?)),
        other => {
            let _ = database_url;
            Err(StoreError::Storage(format!("Unsupported store backend: {other}")))
        }
    }
}
