//! PostgreSQL inventory repository with a JSONB payload column

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::info;

use super::{schema, InventoryRepository, OwnerDirectory, StorageError};
use crate::config::DatabaseConfig;
use crate::model::{self, BufferedRecord, StoredInventory};

#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60))
            .max_lifetime(Duration::from_secs(5 * 60))
            .connect(&config.url)
            .await?;
        let repo = Self { pool };
        repo.run_migrations().await?;
        info!(
            "PostgreSQL inventory repository initialized (max_connections={})",
            config.max_connections
        );
        Ok(repo)
    }

    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(schema::POSTGRES_CREATE_INVENTORIES)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::POSTGRES_CREATE_INDEX_UPDATED_AT)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::POSTGRES_CREATE_INDEX_OWNER)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::POSTGRES_CREATE_KEY_ACCOUNTS)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::POSTGRES_CREATE_INDEX_KEY_ACCOUNTS)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// JSONB only takes text, so payloads must be UTF-8
fn payload_text<'a>(entity_id: &str, payload: &'a [u8]) -> Result<&'a str, StorageError> {
    std::str::from_utf8(payload).map_err(|_| StorageError::InvalidPayload(entity_id.to_string()))
}

#[async_trait]
impl InventoryRepository for PostgresRepository {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_one(
        &self,
        owner_id: Option<i64>,
        entity_id: &str,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let payload = payload_text(entity_id, payload)?;
        sqlx::query(schema::POSTGRES_UPSERT)
            .bind(entity_id)
            .bind(owner_id)
            .bind(payload)
            .bind(Utc::now())
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
            let payload = payload_text(&record.entity_id, &record.payload)?;
            sqlx::query(schema::POSTGRES_UPSERT)
                .bind(&record.entity_id)
                .bind(record.owner_id)
                .bind(payload)
                .bind(record.updated_at)
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
        let row: Option<(Option<i64>, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT owner_id, payload::text, updated_at FROM inventories WHERE entity_id = $1",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(owner_id, payload, updated_at)| StoredInventory {
            owner_id,
            payload: payload.into_bytes(),
            updated_at,
        }))
    }

    async fn delete_inactive(&self, older_than: Duration) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM inventories WHERE updated_at < $1")
            .bind(model::cutoff(older_than))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<Map<String, Value>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                MAX(updated_at) AS last_sync,
                pg_total_relation_size('inventories') AS size
            FROM inventories
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let last_sync: Option<DateTime<Utc>> = row.try_get("last_sync")?;
        let size: i64 = row.try_get("size")?;

        let mut stats = Map::new();
        stats.insert("backend".to_string(), json!(self.backend()));
        stats.insert("total_inventories".to_string(), json!(total));
        if let Some(last_sync) = last_sync {
            stats.insert("last_sync".to_string(), json!(last_sync));
        }
        stats.insert("db_size_bytes".to_string(), json!(size));
        stats.insert(
            "connections".to_string(),
            json!({
                "open": self.pool.size(),
                "idle": self.pool.num_idle(),
            }),
        );
        Ok(stats)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl OwnerDirectory for PostgresRepository {
    async fn owner_of(&self, entity_id: &str) -> Result<Option<i64>, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM key_accounts WHERE entity_id = $1 AND is_active LIMIT 1",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_utf8_payloads() {
        assert_eq!(payload_text("u1", b"{\"a\":1}").unwrap(), "{\"a\":1}");
        assert!(matches!(
            payload_text("u1", &[0xff, 0xfe]),
            Err(StorageError::InvalidPayload(id)) if id == "u1"
        ));
    }
}
