//! Durable inventory storage
//!
//! The buffer drains into an [`InventoryRepository`]. Upserts are keyed by
//! entity id, last write wins, and a missing owner never overwrites a known
//! one, so replaying the same batch is harmless.

mod postgres;
mod schema;
mod sqlite;

pub use postgres::PostgresRepository;
pub use sqlite::SqliteRepository;

#[cfg(test)]
pub(crate) use sqlite::tests::{link_account, memory_repo};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::model::{BufferedRecord, StoredInventory};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to upsert inventory {entity_id}: {source}")]
    Upsert {
        entity_id: String,
        source: sqlx::Error,
    },

    #[error("inventory {0} is not valid JSON text")]
    InvalidPayload(String),

    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Contract every durable backend satisfies
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    /// Name used in stats and logs
    fn backend(&self) -> &'static str;

    /// Insert or replace one inventory, stamped with the current time
    async fn upsert_one(
        &self,
        owner_id: Option<i64>,
        entity_id: &str,
        payload: &[u8],
    ) -> Result<(), StorageError>;

    /// Upsert a batch in one transaction. An error means none of it landed.
    async fn batch_upsert(&self, records: &[BufferedRecord]) -> Result<(), StorageError>;

    async fn get(&self, entity_id: &str) -> Result<Option<StoredInventory>, StorageError>;

    /// Delete inventories not synced within `older_than`
    async fn delete_inactive(&self, older_than: Duration) -> Result<u64, StorageError>;

    async fn stats(&self) -> Result<Map<String, Value>, StorageError>;

    async fn close(&self);
}

/// Resolves which key account a game user belongs to
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn owner_of(&self, entity_id: &str) -> Result<Option<i64>, StorageError>;
}

/// Repository handles selected by `database.driver`
#[derive(Clone)]
pub struct Storage {
    pub inventory: Arc<dyn InventoryRepository>,
    pub owners: Arc<dyn OwnerDirectory>,
}

pub async fn open(config: &DatabaseConfig) -> Result<Storage> {
    match config.driver.as_str() {
        "postgres" => {
            let repo = Arc::new(PostgresRepository::connect(config).await?);
            Ok(Storage {
                inventory: repo.clone(),
                owners: repo,
            })
        }
        _ => {
            let repo = Arc::new(SqliteRepository::connect(config).await?);
            Ok(Storage {
                inventory: repo.clone(),
                owners: repo,
            })
        }
    }
}
