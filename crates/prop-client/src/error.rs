use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("response carried no data")]
    EmptyResponse,
    #[error("request {request_id} faulted: {message}")]
    Faulted { request_id: String, message: String },
    #[error("request {request_id} not finished after {waited:?}")]
    Timeout { request_id: String, waited: Duration },
}
