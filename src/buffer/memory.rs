//! In-process buffer store for single-instance deployments and tests

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::store::{BufferKeys, BufferStore};
use super::BufferError;

#[derive(Default)]
struct Collections {
    records: HashMap<String, HashMap<String, Vec<u8>>>,
    pending: HashMap<String, HashSet<String>>,
}

/// Buffer store kept in process memory.
///
/// Every call takes the single lock for its whole duration, so each method is
/// atomic with respect to the others, matching what the Redis store gets
/// from MULTI/EXEC and Lua.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BufferStore for MemoryStore {
    async fn ping(&self) -> Result<(), BufferError> {
        Ok(())
    }

    async fn put(&self, keys: &BufferKeys, id: &str, value: &[u8]) -> Result<(), BufferError> {
        let mut data = self.inner.lock().await;
        data.records
            .entry(keys.records.clone())
            .or_default()
            .insert(id.to_string(), value.to_vec());
        data.pending
            .entry(keys.pending.clone())
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    async fn get(&self, keys: &BufferKeys, id: &str) -> Result<Option<Vec<u8>>, BufferError> {
        let data = self.inner.lock().await;
        Ok(data
            .records
            .get(&keys.records)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn get_many(
        &self,
        keys: &BufferKeys,
        ids: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, BufferError> {
        let data = self.inner.lock().await;
        let records = data.records.get(&keys.records);
        Ok(ids
            .iter()
            .map(|id| records.and_then(|r| r.get(id)).cloned())
            .collect())
    }

    async fn pending_count(&self, keys: &BufferKeys) -> Result<u64, BufferError> {
        let data = self.inner.lock().await;
        Ok(data.pending.get(&keys.pending).map_or(0, |set| set.len() as u64))
    }

    async fn random_pending(
        &self,
        keys: &BufferKeys,
        count: usize,
    ) -> Result<Vec<String>, BufferError> {
        let data = self.inner.lock().await;
        let Some(set) = data.pending.get(&keys.pending) else {
            return Ok(Vec::new());
        };
        let mut rng = rand::thread_rng();
        Ok(set.iter().cloned().choose_multiple(&mut rng, count))
    }

    async fn pending_members(&self, keys: &BufferKeys) -> Result<Vec<String>, BufferError> {
        let data = self.inner.lock().await;
        Ok(data
            .pending
            .get(&keys.pending)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn unpend_missing(&self, keys: &BufferKeys, ids: &[String]) -> Result<(), BufferError> {
        let mut data = self.inner.lock().await;
        let Collections { records, pending } = &mut *data;
        let Some(set) = pending.get_mut(&keys.pending) else {
            return Ok(());
        };
        let records = records.get(&keys.records);
        for id in ids {
            if !records.is_some_and(|r| r.contains_key(id)) {
                set.remove(id);
            }
        }
        Ok(())
    }

    async fn evict_if_unchanged(
        &self,
        keys: &BufferKeys,
        snapshots: &[(String, Vec<u8>)],
    ) -> Result<usize, BufferError> {
        let mut data = self.inner.lock().await;
        let Collections { records, pending } = &mut *data;
        let (Some(records), Some(set)) = (
            records.get_mut(&keys.records),
            pending.get_mut(&keys.pending),
        ) else {
            return Ok(0);
        };

        let mut deleted = 0;
        for (id, snapshot) in snapshots {
            if records.get(id) == Some(snapshot) {
                records.remove(id);
                set.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> BufferKeys {
        BufferKeys::new("test:inventory")
    }

    #[tokio::test]
    async fn put_marks_pending() {
        let store = MemoryStore::new();
        store.put(&keys(), "1", b"a").await.unwrap();
        store.put(&keys(), "1", b"b").await.unwrap();

        assert_eq!(store.pending_count(&keys()).await.unwrap(), 1);
        assert_eq!(store.get(&keys(), "1").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn random_pending_is_bounded_and_distinct() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store.put(&keys(), &i.to_string(), b"x").await.unwrap();
        }

        let mut ids = store.random_pending(&keys(), 4).await.unwrap();
        assert_eq!(ids.len(), 4);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);

        assert_eq!(store.random_pending(&keys(), 50).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn evict_if_unchanged_skips_modified_values() {
        let store = MemoryStore::new();
        store.put(&keys(), "1", b"old").await.unwrap();
        store.put(&keys(), "2", b"old").await.unwrap();
        store.put(&keys(), "2", b"new").await.unwrap();

        let snapshots = vec![
            ("1".to_string(), b"old".to_vec()),
            ("2".to_string(), b"old".to_vec()),
        ];
        let deleted = store.evict_if_unchanged(&keys(), &snapshots).await.unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(store.get(&keys(), "1").await.unwrap(), None);
        assert_eq!(store.get(&keys(), "2").await.unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.pending_members(&keys()).await.unwrap(), vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn unpend_missing_keeps_live_records() {
        let store = MemoryStore::new();
        let elsewhere = BufferKeys {
            records: "test:elsewhere".to_string(),
            pending: keys().pending,
        };
        store.put(&elsewhere, "ghost", b"a").await.unwrap();
        store.put(&keys(), "live", b"b").await.unwrap();

        let ids = vec!["ghost".to_string(), "live".to_string()];
        store.unpend_missing(&keys(), &ids).await.unwrap();

        assert_eq!(store.pending_members(&keys()).await.unwrap(), vec!["live".to_string()]);
        assert_eq!(store.get(&keys(), "live").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn prefixes_are_isolated() {
        let store = MemoryStore::new();
        let other = BufferKeys::new("other");
        store.put(&keys(), "1", b"a").await.unwrap();

        assert_eq!(store.pending_count(&other).await.unwrap(), 0);
        assert_eq!(store.get(&other, "1").await.unwrap(), None);
    }
}
