//! SQLite-backed result cache.

use async_trait::async_trait;
use prop_types::{CacheEntry, CacheError, CacheKey, Estimate, ResultCache};
use std::path::Path;
use tracing::warn;

/// SQLite ResultCache; one row per entry, payload stored as JSON text.
pub struct SqliteCache {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteCache {
    /// Open (or create) a cache database at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let conn =
            rusqlite::Connection::open(path).map_err(|e| CacheError::Other(e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_access TEXT NOT NULL,
                hits INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .map_err(|e| CacheError::Other(e.to_string()))?;

        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CacheError::Other(format!("failed to acquire lock: {}", e)))?;
        f(&conn).map_err(|e| CacheError::Other(e.to_string()))
    }
}

#[async_trait]
impl ResultCache for SqliteCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let now = chrono::Utc::now().to_rfc3339();
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload, created_at, hits FROM cache_entries WHERE key = ?1",
            )?;
            let mut rows = stmt.query_map(rusqlite::params![key.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            rows.next().transpose()
        })?;

        let Some((payload, created_at, hits)) = row else {
            return Ok(None);
        };
        let payload: Estimate = match serde_json::from_str(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt cache row, discarding");
                self.remove(key).await?;
                return Ok(None);
            }
        };
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE cache_entries SET hits = hits + 1, last_access = ?2 WHERE key = ?1",
                rusqlite::params![key.as_str(), now],
            )
        })?;
        Ok(Some(CacheEntry {
            key: key.clone(),
            payload,
            created_at,
            last_access: now,
            hits: hits as u64 + 1,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let payload =
            serde_json::to_string(&entry.payload).map_err(|e| CacheError::Other(e.to_string()))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (key, payload, created_at, last_access, hits) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    entry.key.as_str(),
                    payload,
                    entry.created_at,
                    entry.last_access,
                    entry.hits as i64
                ],
            )
        })?;
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE key = ?1",
                rusqlite::params![key.as_str()],
            )
        })?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
        })?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqliteCache::new(dir.path().join("cache.sqlite")).unwrap();
        let key = CacheKey("k".into());
        cache
            .put(CacheEntry::new(
                key.clone(),
                Estimate {
                    value: 2.0,
                    uncertainty: 0.1,
                    iterations: 1,
                },
            ))
            .await
            .unwrap();
        assert_eq!(cache.get(&key).await.unwrap().unwrap().hits, 1);

        cache
            .with_conn(|conn| {
                conn.execute("UPDATE cache_entries SET payload = 'garbage' WHERE key = 'k'", [])
            })
            .unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
        assert_eq!(cache.len().await.unwrap(), 0);
    }
}
