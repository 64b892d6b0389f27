//! Persisted run records and the completion ledger.
//!
//! A run writes into `<output>/rep-{r}/{force field}/` under a stem of `properties` (whole
//! dataset) or `prop-{index:04}` (single property):
//!
//! - `<stem>.lock`: held while a driver owns the stem, created with `create_new`.
//! - `<stem>.bin`: postcard snapshot of the RequestResult.
//! - `<stem>.json`: pretty JSON of the RequestResult.
//! - `<stem>.done`: ledger entry, written last. Its presence is the only "already done" signal.
//!
//! Every file is written to a hidden temporary sibling and renamed into place.

use crate::error::Result;
use prop_types::RequestResult;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Output location of one (replicate, force field, property range) run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    dir: PathBuf,
    stem: String,
}

impl RunPaths {
    pub fn new(
        output_root: &Path,
        replicate: u32,
        force_field: &str,
        property_index: Option<usize>,
    ) -> Self {
        let stem = match property_index {
            Some(index) => format!("prop-{index:04}"),
            None => "properties".to_string(),
        };
        Self {
            dir: output_root
                .join(format!("rep-{replicate}"))
                .join(force_field),
            stem,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    fn with_extension(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{extension}", self.stem))
    }

    pub fn json_path(&self) -> PathBuf {
        self.with_extension("json")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.with_extension("bin")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.with_extension("done")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.with_extension("lock")
    }

    pub async fn is_complete(&self) -> bool {
        tokio::fs::try_exists(self.ledger_path())
            .await
            .unwrap_or(false)
    }
}

/// Ledger entry contents. Only its existence is load-bearing; the fields are for humans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub request_id: String,
    pub committed_at: String,
    pub estimated: usize,
    pub unsuccessful: usize,
    pub exceptions: usize,
}

/// Exclusive claim on an output stem. Removed when dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock, or `None` when another live driver holds it. A lock older than
    /// `stale_after` is broken.
    pub async fn acquire(paths: &RunPaths, stale_after: Duration) -> Result<Option<RunLock>> {
        tokio::fs::create_dir_all(paths.dir()).await?;
        let path = paths.lock_path();
        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    let holder = format!(
                        "pid {} at {}\n",
                        std::process::id(),
                        chrono::Utc::now().to_rfc3339()
                    );
                    tokio::fs::write(&path, holder).await?;
                    return Ok(Some(RunLock { path }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !is_stale(&path, stale_after).await {
                        return Ok(None);
                    }
                    warn!(lock = %path.display(), "breaking stale lock");
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        // another driver re-created it between our removal and retry
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(lock = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= stale_after)
        .unwrap_or(false)
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = target.with_file_name(format!(".{name}.tmp"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, target).await?;
    Ok(())
}

/// Write the binary snapshot and the JSON of a result.
pub async fn persist(paths: &RunPaths, result: &RequestResult) -> Result<()> {
    tokio::fs::create_dir_all(paths.dir()).await?;
    write_atomic(&paths.snapshot_path(), &postcard::to_stdvec(result)?).await?;
    write_atomic(&paths.json_path(), &serde_json::to_vec_pretty(result)?).await?;
    Ok(())
}

/// Record the run as complete. Must follow a successful `persist`.
pub async fn commit(paths: &RunPaths, result: &RequestResult) -> Result<()> {
    let entry = LedgerEntry {
        request_id: result.request_id.clone(),
        committed_at: chrono::Utc::now().to_rfc3339(),
        estimated: result.estimated.len(),
        unsuccessful: result.unsuccessful.len(),
        exceptions: result.exceptions.len(),
    };
    write_atomic(&paths.ledger_path(), &serde_json::to_vec_pretty(&entry)?).await?;
    info!(ledger = %paths.ledger_path().display(), "run committed");
    Ok(())
}

pub async fn read_snapshot(paths: &RunPaths) -> Result<RequestResult> {
    let bytes = tokio::fs::read(paths.snapshot_path()).await?;
    Ok(postcard::from_bytes(&bytes)?)
}
