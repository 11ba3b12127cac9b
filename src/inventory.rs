//! Inventory sync and lookup, buffered when a buffer is available

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::{BufferError, Flusher, InventoryBuffer};
use crate::db::{InventoryRepository, OwnerDirectory, StorageError};
use crate::model::BufferedRecord;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Drains buffer batches into a repository
pub struct RepositoryFlusher {
    repo: Arc<dyn InventoryRepository>,
}

impl RepositoryFlusher {
    pub fn new(repo: Arc<dyn InventoryRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl Flusher for RepositoryFlusher {
    async fn flush(&self, batch: &[BufferedRecord]) -> Result<(), StorageError> {
        self.repo.batch_upsert(batch).await
    }
}

/// Latest known inventory for an entity
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    pub owner_id: Option<i64>,
    pub payload: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct InventoryService {
    repo: Arc<dyn InventoryRepository>,
    owners: Arc<dyn OwnerDirectory>,
    buffer: Option<InventoryBuffer>,
}

impl InventoryService {
    pub fn new(
        repo: Arc<dyn InventoryRepository>,
        owners: Arc<dyn OwnerDirectory>,
        buffer: Option<InventoryBuffer>,
    ) -> Self {
        Self {
            repo,
            owners,
            buffer,
        }
    }

    pub fn is_buffered(&self) -> bool {
        self.buffer.is_some()
    }

    /// Record a new inventory payload for `entity_id`
    pub async fn sync(&self, entity_id: &str, payload: Vec<u8>) -> Result<(), SyncError> {
        // An unlinked or unreachable owner is not a reason to drop the sync
        let owner_id = match self.owners.owner_of(entity_id).await {
            Ok(owner) => owner,
            Err(e) => {
                debug!("Owner lookup for {} failed: {}", entity_id, e);
                None
            }
        };

        match &self.buffer {
            Some(buffer) => buffer.add(owner_id, entity_id, payload).await?,
            None => self.repo.upsert_one(owner_id, entity_id, &payload).await?,
        }
        Ok(())
    }

    /// Buffered state first, durable storage second
    pub async fn fetch(&self, entity_id: &str) -> Result<Option<InventorySnapshot>, SyncError> {
        if let Some(buffer) = &self.buffer {
            match buffer.get(entity_id).await {
                Ok(Some(record)) => {
                    return Ok(Some(InventorySnapshot {
                        owner_id: record.owner_id,
                        payload: record.payload,
                        updated_at: record.updated_at,
                    }))
                }
                Ok(None) => {}
                Err(e) => warn!("Buffer lookup for {} failed, reading storage: {}", entity_id, e),
            }
        }

        Ok(self.repo.get(entity_id).await?.map(|stored| InventorySnapshot {
            owner_id: stored.owner_id,
            payload: stored.payload,
            updated_at: stored.updated_at,
        }))
    }
}
