//! File-backed result cache: one JSON file per entry under a root directory.

use crate::InMemoryCache;
use async_trait::async_trait;
use prop_types::{CacheEntry, CacheError, CacheKey, ResultCache};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Local file ResultCache.
///
/// Layout: `<root>/<first two key chars>/<key>.json`. Writes go to a temporary file that is then
/// renamed over the target, so a reader sees either the old entry, the new one, or nothing.
/// Unreadable entries are removed and reported as misses. With `cache_objects_in_memory`, reads
/// are served from an in-process layer after the first load.
pub struct LocalFileCache {
    root: PathBuf,
    memory: Option<InMemoryCache>,
}

impl LocalFileCache {
    pub async fn new(
        root: impl AsRef<Path>,
        cache_objects_in_memory: bool,
    ) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            memory: cache_objects_in_memory.then(InMemoryCache::new),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        let shard: String = key.as_str().chars().take(2).collect();
        self.root.join(shard).join(format!("{}.json", key.as_str()))
    }

    async fn read_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(key = %key, error = %e, "cache entry unreadable, treating as miss");
                return Ok(None);
            }
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if &entry.key == key => Ok(Some(entry)),
            Ok(entry) => {
                warn!(key = %key, stored = %entry.key, "cache entry key mismatch, discarding");
                self.discard(&path).await;
                Ok(None)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt cache entry, discarding");
                self.discard(&path).await;
                Ok(None)
            }
        }
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove corrupt cache entry");
            }
        }
    }
}

#[async_trait]
impl ResultCache for LocalFileCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(ref memory) = self.memory {
            if let Some(entry) = memory.get(key).await? {
                return Ok(Some(entry));
            }
        }
        let entry = self.read_entry(key).await?;
        if let (Some(memory), Some(entry)) = (&self.memory, &entry) {
            memory.put(entry.clone()).await?;
        }
        Ok(entry)
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let path = self.path_for(&entry.key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&entry).map_err(|e| CacheError::Other(e.to_string()))?;
        let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CacheError::Io(e));
        }
        debug!(key = %entry.key, path = %path.display(), "stored cache entry");
        if let Some(ref memory) = self.memory {
            memory.put(entry).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        if let Some(ref memory) = self.memory {
            memory.remove(key).await?;
        }
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let mut count = 0;
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}
