//! Backend selection from configuration.

use crate::{LocalPool, LocalPoolConfig, QueuePool, QueuePoolConfig, SlurmQueue};
use prop_types::{BackendError, CalculationBackend, Estimator};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlurmPoolConfig {
    #[serde(flatten)]
    pub pool: QueuePoolConfig,
    /// Where generated batch scripts are written.
    #[serde(default = "default_script_directory")]
    pub script_directory: PathBuf,
}

fn default_script_directory() -> PathBuf {
    PathBuf::from("worker-scripts")
}

/// Which backend to run, tagged by `kind` (`local` or `slurm`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local(LocalPoolConfig),
    Slurm(SlurmPoolConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local(LocalPoolConfig::default())
    }
}

impl BackendConfig {
    pub fn build(
        &self,
        estimator: Arc<dyn Estimator>,
    ) -> Result<Arc<dyn CalculationBackend>, BackendError> {
        match self {
            BackendConfig::Local(config) => {
                Ok(Arc::new(LocalPool::new(config.clone(), estimator)))
            }
            BackendConfig::Slurm(config) => Ok(Arc::new(QueuePool::new(
                config.pool.clone(),
                Arc::new(SlurmQueue::new(config.script_directory.clone())),
                estimator,
            )?)),
        }
    }
}
