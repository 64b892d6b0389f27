use prop_types::{BackendError, CacheError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request not found: {0}")]
    NotFound(String),
    #[error("server already started")]
    AlreadyStarted,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Envelope code reported over HTTP.
    pub fn code(&self) -> i32 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::NotFound(_) => 404,
            ServerError::AlreadyStarted => 409,
            ServerError::Backend(_) | ServerError::Cache(_) | ServerError::Io(_) => 500,
        }
    }
}
