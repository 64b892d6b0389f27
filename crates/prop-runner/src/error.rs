use prop_client::ClientError;
use prop_server::ServerError;
use prop_types::{BackendError, CacheError};
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse '{path}': {message}", path = path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Snapshot encoding error: {0}")]
    Snapshot(#[from] postcard::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Property index {index} is out of range for a dataset of {len} properties")]
    PropertyIndex { index: usize, len: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}
