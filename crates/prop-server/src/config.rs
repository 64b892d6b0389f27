//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// 0 picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-computation scratch space lives under `<working_directory>/<cache key>`.
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    #[serde(default)]
    pub delete_working_files: bool,
    /// How long a request is kept after its terminal result was retrieved.
    #[serde(default = "default_request_retention_secs")]
    pub request_retention_secs: u64,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_working_directory() -> PathBuf {
    PathBuf::from("working-directory")
}

fn default_request_retention_secs() -> u64 {
    3600
}

fn default_gc_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            working_directory: default_working_directory(),
            delete_working_files: false,
            request_retention_secs: default_request_retention_secs(),
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

impl ServerConfig {
    pub fn request_retention(&self) -> Duration {
        Duration::from_secs(self.request_retention_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }
}
