//! Buffer store abstraction and its Redis implementation
//!
//! The buffer keeps two collections per key prefix: a hash of serialized
//! records keyed by entity id, and a set of entity ids still pending a
//! flush. Every method here is a single atomic operation on the store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, Script};
use tracing::debug;

use super::BufferError;

/// Deletes the record and its pending marker only if the stored value still
/// matches the snapshot that was flushed.
const EVICT_IF_UNCHANGED: &str = r#"
if redis.call("HGET", KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call("HDEL", KEYS[1], ARGV[1])
    redis.call("SREM", KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Drops the pending marker only while no record exists for the id.
const UNPEND_IF_MISSING: &str = r#"
if redis.call("HEXISTS", KEYS[1], ARGV[1]) == 0 then
    return redis.call("SREM", KEYS[2], ARGV[1])
end
return 0
"#;

/// Names of the two collections owned by one buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferKeys {
    pub records: String,
    pub pending: String,
}

impl BufferKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            records: format!("{}:buffer", prefix),
            pending: format!("{}:pending", prefix),
        }
    }
}

#[async_trait]
pub trait BufferStore: Send + Sync {
    async fn ping(&self) -> Result<(), BufferError>;

    /// Upsert the record and mark it pending in one round trip
    async fn put(&self, keys: &BufferKeys, id: &str, value: &[u8]) -> Result<(), BufferError>;

    async fn get(&self, keys: &BufferKeys, id: &str) -> Result<Option<Vec<u8>>, BufferError>;

    /// Values for `ids`, positionally aligned
    async fn get_many(
        &self,
        keys: &BufferKeys,
        ids: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, BufferError>;

    async fn pending_count(&self, keys: &BufferKeys) -> Result<u64, BufferError>;

    /// Up to `count` distinct pending ids in no particular order
    async fn random_pending(&self, keys: &BufferKeys, count: usize)
        -> Result<Vec<String>, BufferError>;

    async fn pending_members(&self, keys: &BufferKeys) -> Result<Vec<String>, BufferError>;

    /// Drop the pending marker of each id that has no record, atomically
    /// per id. A record written since the caller looked keeps its marker.
    async fn unpend_missing(&self, keys: &BufferKeys, ids: &[String]) -> Result<(), BufferError>;

    /// Compare-and-delete each `(id, snapshot)` pair atomically.
    /// Returns how many pairs were deleted.
    async fn evict_if_unchanged(
        &self,
        keys: &BufferKeys,
        snapshots: &[(String, Vec<u8>)],
    ) -> Result<usize, BufferError>;
}

/// Redis-backed buffer store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    evict_script: Script,
    unpend_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, BufferError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            evict_script: Script::new(EVICT_IF_UNCHANGED),
            unpend_script: Script::new(UNPEND_IF_MISSING),
        })
    }

    /// Run a pipeline of EVALSHA calls, loading `source` once if Redis has
    /// not cached it yet
    async fn eval_pipeline(
        &self,
        pipe: &redis::Pipeline,
        source: &str,
    ) -> Result<Vec<i64>, BufferError> {
        let mut conn = self.conn.clone();
        match pipe.query_async(&mut conn).await {
            Ok(results) => Ok(results),
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                debug!("Loading buffer script into Redis");
                let _: String = redis::cmd("SCRIPT")
                    .arg("LOAD")
                    .arg(source)
                    .query_async(&mut conn)
                    .await?;
                Ok(pipe.query_async(&mut conn).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BufferStore for RedisStore {
    async fn ping(&self) -> Result<(), BufferError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn put(&self, keys: &BufferKeys, id: &str, value: &[u8]) -> Result<(), BufferError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(&keys.records, id, value)
            .ignore()
            .sadd(&keys.pending, id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, keys: &BufferKeys, id: &str) -> Result<Option<Vec<u8>>, BufferError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.hget(&keys.records, id).await?;
        Ok(value)
    }

    async fn get_many(
        &self,
        keys: &BufferKeys,
        ids: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, BufferError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(&keys.records)
            .arg(ids)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn pending_count(&self, keys: &BufferKeys) -> Result<u64, BufferError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.scard(&keys.pending).await?;
        Ok(count)
    }

    async fn random_pending(
        &self,
        keys: &BufferKeys,
        count: usize,
    ) -> Result<Vec<String>, BufferError> {
        let mut conn = self.conn.clone();
        // A positive count makes SRANDMEMBER return distinct members
        let ids: Vec<String> = redis::cmd("SRANDMEMBER")
            .arg(&keys.pending)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn pending_members(&self, keys: &BufferKeys) -> Result<Vec<String>, BufferError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(&keys.pending).await?;
        Ok(ids)
    }

    async fn unpend_missing(&self, keys: &BufferKeys, ids: &[String]) -> Result<(), BufferError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("EVALSHA")
                .arg(self.unpend_script.get_hash())
                .arg(2)
                .arg(&keys.records)
                .arg(&keys.pending)
                .arg(id);
        }

        self.eval_pipeline(&pipe, UNPEND_IF_MISSING).await?;
        Ok(())
    }

    async fn evict_if_unchanged(
        &self,
        keys: &BufferKeys,
        snapshots: &[(String, Vec<u8>)],
    ) -> Result<usize, BufferError> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for (id, snapshot) in snapshots {
            pipe.cmd("EVALSHA")
                .arg(self.evict_script.get_hash())
                .arg(2)
                .arg(&keys.records)
                .arg(&keys.pending)
                .arg(id)
                .arg(snapshot.as_slice());
        }

        let deleted = self.eval_pipeline(&pipe, EVICT_IF_UNCHANGED).await?;
        Ok(deleted.into_iter().filter(|d| *d == 1).count())
    }
}
