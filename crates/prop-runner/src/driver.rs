//! Idempotent run driver: one (replicate, force field, property range) per invocation.
//!
//! The driver checks the ledger before it starts anything, so re-running a batch after a partial
//! failure only repeats the runs that never committed.

use crate::error::{Result, RunnerError};
use crate::ledger::{self, RunLock, RunPaths};
use prop_backend::BackendConfig;
use prop_cache::LocalFileCache;
use prop_client::{ConnectionOptions, EstimationClient};
use prop_server::{EstimationServer, ServerConfig};
use prop_types::{
    CalculationBackend, DataSet, Estimator, ForceFieldSource, RequestOptions, RequestResult,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub output_directory: PathBuf,
    /// Result cache root; defaults to `<output_directory>/stored_data`.
    #[serde(default)]
    pub storage_directory: Option<PathBuf>,
    #[serde(default = "default_replicate")]
    pub replicate: u32,
    /// Run a single property of the dataset instead of all of it.
    #[serde(default)]
    pub property_index: Option<usize>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// The server listens on `base_port + property_index`; 0 picks a free port.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,
    /// Give up waiting after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_delete_working_files")]
    pub delete_working_files: bool,
    /// A lock file older than this is treated as left behind by a dead driver.
    #[serde(default = "default_stale_lock_after_secs")]
    pub stale_lock_after_secs: u64,
}

fn default_replicate() -> u32 {
    1
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    8100
}

fn default_polling_interval_secs() -> u64 {
    30
}

fn default_delete_working_files() -> bool {
    true
}

fn default_stale_lock_after_secs() -> u64 {
    7 * 24 * 3600
}

impl DriverConfig {
    pub fn new(output_directory: impl Into<PathBuf>) -> Self {
        Self {
            output_directory: output_directory.into(),
            storage_directory: None,
            replicate: default_replicate(),
            property_index: None,
            bind_address: default_bind_address(),
            base_port: default_base_port(),
            polling_interval_secs: default_polling_interval_secs(),
            timeout_secs: None,
            delete_working_files: default_delete_working_files(),
            stale_lock_after_secs: default_stale_lock_after_secs(),
        }
    }

    pub fn storage_directory(&self) -> PathBuf {
        self.storage_directory
            .clone()
            .unwrap_or_else(|| self.output_directory.join("stored_data"))
    }

    pub fn port(&self) -> u16 {
        if self.base_port == 0 {
            return 0;
        }
        let offset = self.property_index.unwrap_or(0);
        self.base_port.saturating_add(offset.min(u16::MAX as usize) as u16)
    }

    fn connect_address(&self) -> String {
        match self.bind_address.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub request_id: String,
    pub json_path: PathBuf,
    pub estimated: usize,
    pub unsuccessful: usize,
    pub exceptions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The ledger already records this run.
    Skipped { ledger: PathBuf },
    /// Another driver holds the lock for this run.
    Locked { lock: PathBuf },
    Completed(RunSummary),
}

pub struct RunDriver {
    config: DriverConfig,
    backend: BackendConfig,
    estimator: Arc<dyn Estimator>,
}

impl RunDriver {
    pub fn new(config: DriverConfig, backend: BackendConfig, estimator: Arc<dyn Estimator>) -> Self {
        Self {
            config,
            backend,
            estimator,
        }
    }

    pub fn paths(&self, force_field: &ForceFieldSource) -> RunPaths {
        RunPaths::new(
            &self.config.output_directory,
            self.config.replicate,
            &force_field.name,
            self.config.property_index,
        )
    }

    pub async fn run(
        &self,
        dataset: &DataSet,
        force_field: &ForceFieldSource,
        options: &RequestOptions,
    ) -> Result<RunOutcome> {
        let dataset = match self.config.property_index {
            Some(index) => dataset.single(index).ok_or(RunnerError::PropertyIndex {
                index,
                len: dataset.len(),
            })?,
            None => dataset.clone(),
        };
        let paths = self.paths(force_field);
        if paths.is_complete().await {
            info!(ledger = %paths.ledger_path().display(), "run already complete, skipping");
            return Ok(RunOutcome::Skipped {
                ledger: paths.ledger_path(),
            });
        }

        let stale_after = Duration::from_secs(self.config.stale_lock_after_secs);
        let Some(lock) = RunLock::acquire(&paths, stale_after).await? else {
            warn!(lock = %paths.lock_path().display(), "run is locked by another driver");
            return Ok(RunOutcome::Locked {
                lock: paths.lock_path(),
            });
        };
        // the previous holder may have committed just before we took over
        if paths.is_complete().await {
            info!(ledger = %paths.ledger_path().display(), "run already complete, skipping");
            return Ok(RunOutcome::Skipped {
                ledger: paths.ledger_path(),
            });
        }

        info!(
            replicate = self.config.replicate,
            force_field = %force_field.name,
            properties = dataset.len(),
            output = %paths.json_path().display(),
            "starting run"
        );
        let result = self
            .estimate(&paths, dataset, force_field.clone(), options.clone())
            .await?;

        ledger::persist(&paths, &result).await?;
        ledger::commit(&paths, &result).await?;
        drop(lock);

        info!(
            estimated = result.estimated.len(),
            unsuccessful = result.unsuccessful.len(),
            exceptions = result.exceptions.len(),
            "run complete"
        );
        Ok(RunOutcome::Completed(RunSummary {
            request_id: result.request_id.clone(),
            json_path: paths.json_path(),
            estimated: result.estimated.len(),
            unsuccessful: result.unsuccessful.len(),
            exceptions: result.exceptions.len(),
        }))
    }

    /// Bring up a backend and server, submit, wait, and tear both down again.
    async fn estimate(
        &self,
        paths: &RunPaths,
        dataset: DataSet,
        force_field: ForceFieldSource,
        options: RequestOptions,
    ) -> Result<RequestResult> {
        let backend = self.backend.build(Arc::clone(&self.estimator))?;
        backend.start().await?;

        let outcome: Result<RequestResult> = async {
            let cache = LocalFileCache::new(self.config.storage_directory(), true).await?;
            let server = EstimationServer::new(
                ServerConfig {
                    bind_address: self.config.bind_address.clone(),
                    port: self.config.port(),
                    working_directory: paths.dir().join("working-directory"),
                    delete_working_files: self.config.delete_working_files,
                    ..Default::default()
                },
                Arc::clone(&backend),
                Arc::new(cache),
            );
            let addr = server.start().await?;
            let result = self
                .submit_and_wait(addr.port(), dataset, force_field, options)
                .await;
            server.stop().await?;
            result
        }
        .await;

        if let Err(e) = backend.stop().await {
            error!(error = %e, "failed to stop backend");
        }
        outcome
    }

    async fn submit_and_wait(
        &self,
        port: u16,
        dataset: DataSet,
        force_field: ForceFieldSource,
        options: RequestOptions,
    ) -> Result<RequestResult> {
        let client =
            EstimationClient::new(ConnectionOptions::new(self.config.connect_address(), port));
        let handle = client
            .request_estimate(dataset, force_field, options, vec![self.config.replicate])
            .await?;
        info!(request_id = %handle.id(), work_items = handle.work_items(), "request submitted");

        let polling_interval = Duration::from_secs(self.config.polling_interval_secs);
        match self.config.timeout_secs {
            Some(secs) => Ok(handle
                .results_with_timeout(polling_interval, Duration::from_secs(secs))
                .await?),
            None => handle
                .results(true, polling_interval)
                .await?
                .ok_or_else(|| RunnerError::Config("synchronous wait returned no result".into())),
        }
    }
}
