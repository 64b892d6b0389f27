//! In-memory result cache with optional least-recently-used eviction.

use async_trait::async_trait;
use prop_types::{CacheEntry, CacheError, CacheKey, ResultCache};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Slot {
    entry: CacheEntry,
    /// Logical access time; larger is more recent.
    touched: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Slot>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// In-memory ResultCache. With a capacity, the least recently used entry is evicted on insert.
#[derive(Clone)]
pub struct InMemoryCache {
    inner: Arc<RwLock<Inner>>,
    capacity: Option<usize>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            capacity: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            capacity: Some(capacity.max(1)),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let mut guard = self.inner.write().await;
        let now = guard.tick();
        Ok(guard.entries.get_mut(key).map(|slot| {
            slot.touched = now;
            slot.entry.hits += 1;
            slot.entry.last_access = chrono::Utc::now().to_rfc3339();
            slot.entry.clone()
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut guard = self.inner.write().await;
        let now = guard.tick();
        if let Some(capacity) = self.capacity {
            if !guard.entries.contains_key(&entry.key) && guard.entries.len() >= capacity {
                let oldest = guard
                    .entries
                    .iter()
                    .min_by_key(|(_, slot)| slot.touched)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    tracing::debug!(key = %oldest, "evicting least recently used cache entry");
                    guard.entries.remove(&oldest);
                }
            }
        }
        guard.entries.insert(
            entry.key.clone(),
            Slot {
                entry,
                touched: now,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.inner.write().await.entries.remove(key);
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.inner.read().await.entries.len())
    }
}
