//! Write-behind inventory buffer
//!
//! Inventory syncs land in a shared store (Redis in production) and are
//! drained to durable storage in small batches by a background loop. This
//! keeps request-rate write pressure away from a slow database.
//!
//! Delivery to storage is at-least-once. A record is only removed from the
//! buffer after a successful flush, and only if nobody replaced it while the
//! flush was in flight.

mod memory;
mod store;
mod worker;

pub use memory::MemoryStore;
pub use store::{BufferKeys, BufferStore, RedisStore};
pub use worker::LoopState;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::db::StorageError;
use crate::model::{self, BufferedRecord};
use worker::BufferWorker;

/// Kept low so a slow database is never handed a huge batch
pub const MAX_BATCH_SIZE: usize = 20;
/// Upper bound for a single background flush
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound for the whole drain on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);
/// Pending records older than this are presumed abandoned
pub const STALE_DATA_THRESHOLD: Duration = Duration::from_secs(60 * 60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KEY_PREFIX: &str = "inventory-relay:inventory";

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("buffer store did not answer within {0:?}")]
    Unreachable(Duration),

    #[error("failed to encode buffered record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("buffered record for {entity_id} is corrupt: {source}")]
    Corrupt {
        entity_id: String,
        source: serde_json::Error,
    },

    #[error("flush to storage failed: {0}")]
    Flush(#[from] StorageError),
}

/// Persists a batch of buffered records.
///
/// Called with 1..=max_batch_size records. Must tolerate seeing the same
/// entity more than once across calls, including older payloads.
#[async_trait]
pub trait Flusher: Send + Sync {
    async fn flush(&self, batch: &[BufferedRecord]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub key_prefix: String,
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub stale_threshold: Duration,
    pub cleanup_interval: Duration,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            flush_interval: Duration::from_secs(30),
            max_batch_size: MAX_BATCH_SIZE,
            stale_threshold: STALE_DATA_THRESHOLD,
            cleanup_interval: CLEANUP_INTERVAL,
        }
    }
}

/// State shared between the public handle and the background loops
pub(crate) struct BufferCore {
    store: Arc<dyn BufferStore>,
    flusher: Arc<dyn Flusher>,
    keys: BufferKeys,
    settings: BufferSettings,
}

impl BufferCore {
    async fn add(
        &self,
        owner_id: Option<i64>,
        entity_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), BufferError> {
        let record = BufferedRecord::new(owner_id, entity_id.to_string(), payload);
        let encoded = serde_json::to_vec(&record)?;
        self.store.put(&self.keys, entity_id, &encoded).await
    }

    async fn get(&self, entity_id: &str) -> Result<Option<BufferedRecord>, BufferError> {
        let Some(raw) = self.store.get(&self.keys, entity_id).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| BufferError::Corrupt {
                entity_id: entity_id.to_string(),
                source,
            })
    }

    async fn count(&self) -> Result<u64, BufferError> {
        self.store.pending_count(&self.keys).await
    }

    async fn flush_batch(&self) -> Result<usize, BufferError> {
        let ids = self
            .store
            .random_pending(&self.keys, self.settings.max_batch_size)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let values = self.store.get_many(&self.keys, &ids).await?;

        let mut batch = Vec::with_capacity(ids.len());
        let mut snapshots = Vec::with_capacity(ids.len());
        let mut orphaned = Vec::new();
        let mut corrupt = Vec::new();

        for (id, value) in ids.into_iter().zip(values) {
            match value {
                // Already flushed or evicted by someone else
                None => orphaned.push(id),
                Some(raw) => match serde_json::from_slice::<BufferedRecord>(&raw) {
                    Ok(record) => {
                        batch.push(record);
                        snapshots.push((id, raw));
                    }
                    Err(e) => {
                        warn!("Evicting corrupt buffered record {}: {}", id, e);
                        corrupt.push((id, raw));
                    }
                },
            }
        }

        if let Err(e) = self.store.unpend_missing(&self.keys, &orphaned).await {
            warn!("Failed to drop {} orphaned pending ids: {}", orphaned.len(), e);
        }
        // A corrupt value replaced by a fresh add since the read stays put
        if let Err(e) = self.store.evict_if_unchanged(&self.keys, &corrupt).await {
            warn!("Failed to evict {} corrupt records: {}", corrupt.len(), e);
        }

        if batch.is_empty() {
            return Ok(0);
        }

        debug!("Flushing {} buffered records", batch.len());
        if let Err(e) = self.flusher.flush(&batch).await {
            error!("Failed to flush {} buffered records: {}", batch.len(), e);
            return Err(e.into());
        }

        // The batch is persisted at this point; a failure to clear it only
        // means it gets written again next tick.
        match self.store.evict_if_unchanged(&self.keys, &snapshots).await {
            Ok(cleared) if cleared < batch.len() => debug!(
                "{} records changed during flush and stay pending",
                batch.len() - cleared
            ),
            Ok(_) => {}
            Err(e) => error!("Failed to clear flushed records from buffer: {}", e),
        }

        info!("Flushed {} buffered records", batch.len());
        Ok(batch.len())
    }

    async fn cleanup_stale(&self) -> Result<usize, BufferError> {
        self.cleanup_older_than(model::cutoff(self.settings.stale_threshold))
            .await
    }

    /// Evict records whose `updated_at` is strictly before `cutoff`, plus any
    /// record that no longer decodes
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, BufferError> {
        let ids = self.store.pending_members(&self.keys).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let values = self.store.get_many(&self.keys, &ids).await?;

        let mut stale = Vec::new();
        let mut orphaned = Vec::new();
        for (id, value) in ids.into_iter().zip(values) {
            match value {
                None => orphaned.push(id),
                Some(raw) => match serde_json::from_slice::<BufferedRecord>(&raw) {
                    Ok(record) if record.updated_at < cutoff => stale.push((id, raw)),
                    Ok(_) => {}
                    Err(_) => stale.push((id, raw)),
                },
            }
        }

        self.store.unpend_missing(&self.keys, &orphaned).await?;
        // Only the exact values judged stale go; a newer add survives
        let evicted = self.store.evict_if_unchanged(&self.keys, &stale).await?;

        if evicted > 0 {
            info!("Cleaned up {} stale buffered records", evicted);
        }
        Ok(evicted)
    }
}

/// Handle to a running write-behind buffer. Cheap to clone.
#[derive(Clone)]
pub struct InventoryBuffer {
    core: Arc<BufferCore>,
    worker: Arc<BufferWorker>,
}

impl InventoryBuffer {
    /// Connect to Redis and start the buffer
    pub async fn connect(
        redis_url: &str,
        flusher: Arc<dyn Flusher>,
        settings: BufferSettings,
    ) -> Result<Self, BufferError> {
        let store = timeout(CONNECT_TIMEOUT, RedisStore::connect(redis_url))
            .await
            .map_err(|_| BufferError::Unreachable(CONNECT_TIMEOUT))??;
        Self::start(Arc::new(store), flusher, settings).await
    }

    /// Verify the store answers, then start the drain loop and sweeper
    pub async fn start(
        store: Arc<dyn BufferStore>,
        flusher: Arc<dyn Flusher>,
        settings: BufferSettings,
    ) -> Result<Self, BufferError> {
        timeout(CONNECT_TIMEOUT, store.ping())
            .await
            .map_err(|_| BufferError::Unreachable(CONNECT_TIMEOUT))??;

        let core = Arc::new(BufferCore {
            store,
            flusher,
            keys: BufferKeys::new(&settings.key_prefix),
            settings,
        });
        let worker = BufferWorker::spawn(core.clone());

        info!(
            "Inventory buffer started (prefix={}, flush_interval={:?}, batch_size={})",
            core.settings.key_prefix, core.settings.flush_interval, core.settings.max_batch_size
        );

        Ok(Self {
            core,
            worker: Arc::new(worker),
        })
    }

    /// Buffer an inventory update; the last write for an entity wins
    pub async fn add(
        &self,
        owner_id: Option<i64>,
        entity_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), BufferError> {
        self.core.add(owner_id, entity_id, payload).await
    }

    /// Pending record for `entity_id`, if one is buffered
    pub async fn get(&self, entity_id: &str) -> Result<Option<BufferedRecord>, BufferError> {
        self.core.get(entity_id).await
    }

    /// Number of entities waiting to be flushed
    pub async fn count(&self) -> Result<u64, BufferError> {
        self.core.count().await
    }

    /// Flush up to one batch and return how many records were persisted
    pub async fn flush_batch(&self) -> Result<usize, BufferError> {
        self.core.flush_batch().await
    }

    pub async fn flush(&self) -> Result<(), BufferError> {
        self.flush_batch().await.map(|_| ())
    }

    /// Evict records older than the configured stale threshold
    pub async fn cleanup_stale(&self) -> Result<usize, BufferError> {
        self.core.cleanup_stale().await
    }

    pub fn state(&self) -> LoopState {
        self.worker.state()
    }

    /// Stop the background loops after draining pending writes. Idempotent.
    pub async fn stop(&self) {
        self.worker.stop().await
    }
}
