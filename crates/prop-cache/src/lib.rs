//! Result cache: key derivation plus in-memory, local-file and SQLite stores.

mod key;
mod local_file;
mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use key::cache_key;
pub use local_file::LocalFileCache;
pub use memory::InMemoryCache;
pub use prop_types::{CacheEntry, CacheError, CacheKey, ResultCache};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCache;
