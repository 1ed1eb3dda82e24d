use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppResult;
use crate::infrastructure::traits::{CacheRegion, RegionFactory};

#[derive(Debug, Clone)]
struct TimedEntry {
    data: Vec<u8>,
    inserted_at: Instant,
}

/// Bounded in-process cache region with optional time-to-live
pub struct LruCacheRegion {
    name: String,
    inner: Mutex<LruCache<String, TimedEntry>>,
    ttl: Option<Duration>,
}

impl LruCacheRegion {
    pub fn new(name: &str, capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.to_string(),
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn expired(&self, entry: &TimedEntry) -> bool {
        self.ttl
            .map(|ttl| entry.inserted_at.elapsed() > ttl)
            .unwrap_or(false)
    }
}

#[async_trait]
impl CacheRegion for LruCacheRegion {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>> {
        let mut cache = self.inner.lock().await;
        let expired = match cache.get(key) {
            Some(entry) if !self.expired(entry) => return Ok(Some(entry.data.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            debug!("Region {}: entry {} expired", self.name, key);
            cache.pop(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> AppResult<()> {
        self.inner.lock().await.put(
            key.to_string(),
            TimedEntry {
                data: value,
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn evict(&self, key: &str) -> AppResult<()> {
        self.inner.lock().await.pop(key);
        Ok(())
    }

    async fn evict_all(&self) -> AppResult<()> {
        self.inner.lock().await.clear();
        Ok(())
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Builds LRU regions of a fixed capacity
#[derive(Debug, Clone)]
pub struct LruRegionFactory {
    capacity: usize,
}

impl LruRegionFactory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for LruRegionFactory {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl RegionFactory for LruRegionFactory {
    fn build_region(&self, name: &str, ttl: Option<Duration>) -> Arc<dyn CacheRegion> {
        Arc::new(LruCacheRegion::new(name, self.capacity, ttl))
    }
}
