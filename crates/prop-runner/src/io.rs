//! Loading batch inputs from disk.

use crate::error::{Result, RunnerError};
use prop_backend::BackendConfig;
use prop_types::{DataSet, ForceFieldSource, RequestOptions};
use serde::de::DeserializeOwned;
use std::path::Path;

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| RunnerError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Dataset JSON: `{"properties": [...]}`.
pub async fn load_dataset(path: &Path) -> Result<DataSet> {
    read_json(path).await
}

pub async fn load_options(path: &Path) -> Result<RequestOptions> {
    read_json(path).await
}

/// Force field file. The name is the file stem; the content is kept verbatim.
pub async fn load_force_field(path: &Path) -> Result<ForceFieldSource> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| RunnerError::Config(format!("no file name in {}", path.display())))?;
    let content = tokio::fs::read_to_string(path).await?;
    Ok(ForceFieldSource::new(name, content))
}

/// Backend configuration in YAML, tagged by `kind`.
pub async fn load_backend_config(path: &Path) -> Result<BackendConfig> {
    let text = tokio::fs::read_to_string(path).await?;
    serde_yaml::from_str(&text).map_err(|e| RunnerError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
