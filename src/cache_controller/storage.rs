//! Named cache partitions.

use super::types::{CacheError, FetchRequest, FetchResponse};
use async_trait::async_trait;
use lru::LruCache;
use std::{collections::BTreeMap, num::NonZeroUsize};
use tokio::sync::RwLock;

/// A set of named partitions, each mapping request keys to responses.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the partition if it does not exist yet.
    async fn open(&self, partition: &str) -> Result<(), CacheError>;

    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Drop a partition and every entry in it. Returns whether it existed.
    async fn delete(&self, partition: &str) -> Result<bool, CacheError>;

    async fn match_in(
        &self,
        partition: &str,
        request: &FetchRequest,
    ) -> Result<Option<FetchResponse>, CacheError>;

    /// Look the request up across every partition.
    async fn match_any(&self, request: &FetchRequest) -> Result<Option<FetchResponse>, CacheError>;

    /// Store a response, creating the partition lazily.
    async fn put(
        &self,
        partition: &str,
        request: &FetchRequest,
        response: FetchResponse,
    ) -> Result<(), CacheError>;
}

/// Entries kept per partition unless configured otherwise.
pub const DEFAULT_PARTITION_CAPACITY: NonZeroUsize = NonZeroUsize::MIN.saturating_add(511);

/// Process-local cache storage. Each partition holds at most `capacity`
/// entries; a put beyond that evicts the least recently used one.
pub struct MemoryCacheStorage {
    capacity: NonZeroUsize,
    partitions: RwLock<BTreeMap<String, LruCache<String, FetchResponse>>>,
}

impl Default for MemoryCacheStorage {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PARTITION_CAPACITY)
    }
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            partitions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of entries in a partition, if it exists.
    pub async fn len(&self, partition: &str) -> Option<usize> {
        self.partitions.read().await.get(partition).map(LruCache::len)
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, partition: &str) -> Result<(), CacheError> {
        self.partitions
            .write()
            .await
            .entry(partition.to_string())
            .or_insert_with(|| LruCache::new(self.capacity));
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    async fn delete(&self, partition: &str) -> Result<bool, CacheError> {
        Ok(self.partitions.write().await.remove(partition).is_some())
    }

    // Lookups take the write lock: a hit refreshes the entry's recency.
    async fn match_in(
        &self,
        partition: &str,
        request: &FetchRequest,
    ) -> Result<Option<FetchResponse>, CacheError> {
        Ok(self
            .partitions
            .write()
            .await
            .get_mut(partition)
            .and_then(|entries| entries.get(&request.cache_key()))
            .cloned())
    }

    async fn match_any(&self, request: &FetchRequest) -> Result<Option<FetchResponse>, CacheError> {
        let key = request.cache_key();
        Ok(self
            .partitions
            .write()
            .await
            .values_mut()
            .find_map(|entries| entries.get(&key).cloned()))
    }

    async fn put(
        &self,
        partition: &str,
        request: &FetchRequest,
        response: FetchResponse,
    ) -> Result<(), CacheError> {
        self.partitions
            .write()
            .await
            .entry(partition.to_string())
            .or_insert_with(|| LruCache::new(self.capacity))
            .put(request.cache_key(), response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use url::Url;

    fn req(path: &str) -> FetchRequest {
        FetchRequest::get(Url::parse("https://app.test").unwrap().join(path).unwrap())
    }

    #[tokio::test]
    async fn partitions_are_isolated_and_deletable() {
        let cache = MemoryCacheStorage::new();
        let resp = FetchResponse::new(StatusCode::OK, req("/a.js").url, "a");
        cache.put("static-v1", &req("/a.js"), resp).await.unwrap();
        cache.open("dynamic-v1").await.unwrap();

        assert!(cache.match_in("dynamic-v1", &req("/a.js")).await.unwrap().is_none());
        assert!(cache.match_in("static-v1", &req("/a.js")).await.unwrap().is_some());
        assert!(cache.match_any(&req("/a.js#frag")).await.unwrap().is_some());

        assert_eq!(cache.keys().await.unwrap(), vec!["dynamic-v1", "static-v1"]);
        assert!(cache.delete("static-v1").await.unwrap());
        assert!(!cache.delete("static-v1").await.unwrap());
        assert!(cache.match_any(&req("/a.js")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_partitions_evict_the_least_recently_used_entry() {
        let cache = MemoryCacheStorage::with_capacity(NonZeroUsize::new(3).unwrap());
        for name in ["/0.js", "/1.js", "/2.js"] {
            let resp = FetchResponse::new(StatusCode::OK, req(name).url, name);
            cache.put("static-v1", &req(name), resp).await.unwrap();
        }
        // Touch /0.js so /1.js becomes the oldest.
        assert!(cache.match_in("static-v1", &req("/0.js")).await.unwrap().is_some());

        for name in ["/3.js", "/4.js"] {
            let resp = FetchResponse::new(StatusCode::OK, req(name).url, name);
            cache.put("static-v1", &req(name), resp).await.unwrap();
        }

        assert_eq!(cache.len("static-v1").await, Some(3));
        assert!(cache.match_in("static-v1", &req("/0.js")).await.unwrap().is_some());
        assert!(cache.match_in("static-v1", &req("/1.js")).await.unwrap().is_none());
        assert!(cache.match_in("static-v1", &req("/2.js")).await.unwrap().is_none());
        assert!(cache.match_in("static-v1", &req("/4.js")).await.unwrap().is_some());
    }
}
