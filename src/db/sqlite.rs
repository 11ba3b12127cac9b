//! SQLite inventory repository (single writer, WAL)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::{schema, InventoryRepository, OwnerDirectory, StorageError};
use crate::config::DatabaseConfig;
use crate::model::{self, BufferedRecord, StoredInventory};

#[derive(Clone)]
pub struct SqliteRepository {
    pool: Pool<Sqlite>,
}

impl SqliteRepository {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        if let Some(dir) = Path::new(&config.url)
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(dir).await.map_err(sqlx::Error::Io)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&format!("sqlite:{}?mode=rwc", config.url))
            .await?;
        let repo = Self::from_pool(pool);
        repo.run_migrations().await?;
        info!("SQLite inventory repository initialized: {}", config.url);
        Ok(repo)
    }

    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::SQLITE_CREATE_INVENTORIES)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::SQLITE_CREATE_INDEX_UPDATED_AT)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::SQLITE_CREATE_KEY_ACCOUNTS)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::SQLITE_CREATE_INDEX_KEY_ACCOUNTS)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn from_millis(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_else(Utc::now)
}

#[async_trait]
impl InventoryRepository for SqliteRepository {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn upsert_one(
        &self,
        owner_id: Option<i64>,
        entity_id: &str,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        sqlx::query(schema::SQLITE_UPSERT)
            .bind(entity_id)
            .bind(owner_id)
            .bind(payload)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|source| StorageError::Upsert {
                entity_id: entity_id.to_string(),
                source,
            })?;
        Ok(())
    }

    async fn batch_upsert(&self, records: &[BufferedRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(schema::SQLITE_UPSERT)
                .bind(&record.entity_id)
                .bind(record.owner_id)
                .bind(&record.payload)
                .bind(record.updated_at.timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(|source| StorageError::Upsert {
                    entity_id: record.entity_id.clone(),
                    source,
                })?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, entity_id: &str) -> Result<Option<StoredInventory>, StorageError> {
        let row: Option<(Option<i64>, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT owner_id, payload, updated_at FROM inventories WHERE entity_id = ?",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(owner_id, payload, updated_at)| StoredInventory {
            owner_id,
            payload,
            updated_at: from_millis(updated_at),
        }))
    }

    async fn delete_inactive(&self, older_than: Duration) -> Result<u64, StorageError> {
        let cutoff = model::cutoff(older_than).timestamp_millis();
        let result = sqlx::query("DELETE FROM inventories WHERE updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<Map<String, Value>, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM inventories")
            .fetch_one(&self.pool)
            .await?;
        let (last_sync,): (Option<i64>,) = sqlx::query_as("SELECT MAX(updated_at) FROM inventories")
            .fetch_one(&self.pool)
            .await?;
        let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        let mut stats = Map::new();
        stats.insert("backend".to_string(), json!(self.backend()));
        stats.insert("total_inventories".to_string(), json!(count));
        if let Some(ts) = last_sync {
            stats.insert("last_sync".to_string(), json!(from_millis(ts)));
        }
        stats.insert("db_size_bytes".to_string(), json!(page_count * page_size));
        Ok(stats)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl OwnerDirectory for SqliteRepository {
    async fn owner_of(&self, entity_id: &str) -> Result<Option<i64>, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM key_accounts WHERE entity_id = ? AND is_active = 1 LIMIT 1",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn memory_repo() -> SqliteRepository {
        // A single connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SqliteRepository::from_pool(pool);
        repo.run_migrations().await.unwrap();
        repo
    }

    pub(crate) async fn link_account(repo: &SqliteRepository, entity_id: &str, active: bool) {
        sqlx::query("INSERT INTO key_accounts (entity_id, is_active) VALUES (?, ?)")
            .bind(entity_id)
            .bind(active)
            .execute(&repo.pool)
            .await
            .unwrap();
    }

    fn record(entity_id: &str, owner_id: Option<i64>, payload: &str, age: chrono::Duration) -> BufferedRecord {
        BufferedRecord {
            owner_id,
            entity_id: entity_id.to_string(),
            payload: payload.as_bytes().to_vec(),
            updated_at: Utc::now() - age,
        }
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let repo = memory_repo().await;
        repo.upsert_one(Some(9), "u1", b"{\"fish\":3}").await.unwrap();

        let stored = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.owner_id, Some(9));
        assert_eq!(stored.payload, b"{\"fish\":3}");
        assert!(repo.get("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_owner_does_not_erase_known_owner() {
        let repo = memory_repo().await;
        repo.upsert_one(Some(9), "u1", b"{}").await.unwrap();
        repo.upsert_one(None, "u1", b"{\"v\":2}").await.unwrap();

        let stored = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.owner_id, Some(9));
        assert_eq!(stored.payload, b"{\"v\":2}");
    }

    #[tokio::test]
    async fn batch_upsert_is_idempotent() {
        let repo = memory_repo().await;
        let batch = vec![
            record("a", Some(1), "{\"v\":1}", chrono::Duration::zero()),
            record("b", None, "{\"v\":1}", chrono::Duration::zero()),
        ];
        repo.batch_upsert(&batch).await.unwrap();
        repo.batch_upsert(&batch).await.unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats["total_inventories"], json!(2));
        assert_eq!(stats["backend"], json!("sqlite"));
        assert!(stats.contains_key("last_sync"));

        let a = repo.get("a").await.unwrap().unwrap();
        assert_eq!(a.updated_at.timestamp_millis(), batch[0].updated_at.timestamp_millis());
    }

    #[tokio::test]
    async fn delete_inactive_removes_only_old_rows() {
        let repo = memory_repo().await;
        repo.batch_upsert(&[
            record("old", None, "{}", chrono::Duration::hours(3)),
            record("new", None, "{}", chrono::Duration::minutes(5)),
        ])
        .await
        .unwrap();

        let deleted = repo.delete_inactive(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.get("old").await.unwrap().is_none());
        assert!(repo.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn owner_lookup_ignores_inactive_accounts() {
        let repo = memory_repo().await;
        link_account(&repo, "u1", false).await;
        link_account(&repo, "u1", true).await;
        link_account(&repo, "u2", false).await;

        assert_eq!(repo.owner_of("u1").await.unwrap(), Some(2));
        assert_eq!(repo.owner_of("u2").await.unwrap(), None);
        assert_eq!(repo.owner_of("u3").await.unwrap(), None);
    }
}
