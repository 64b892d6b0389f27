//! HTTP client for the estimation server.

use crate::ClientError;
use prop_types::{
    BackendStatus, BaseResponse, DataSet, ForceFieldSource, RequestOptions, RequestResult,
    RequestStatus, RequestStatusData, SubmitData, SubmitRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Where the estimation server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default = "default_server_address")]
    pub server_address: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_server_address() -> String {
    "localhost".to_string()
}

fn default_server_port() -> u16 {
    8000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            server_port: default_server_port(),
        }
    }
}

impl ConnectionOptions {
    pub fn new(server_address: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_address: server_address.into(),
            server_port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.server_address, self.server_port)
    }
}

/// Client for one estimation server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EstimationClient {
    client: reqwest::Client,
    base_url: String,
}

impl EstimationClient {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: options.base_url(),
        }
    }

    /// Submit a dataset for estimation under one force field, once per replicate.
    pub async fn request_estimate(
        &self,
        dataset: DataSet,
        force_field: ForceFieldSource,
        options: RequestOptions,
        replicates: Vec<u32>,
    ) -> Result<RequestHandle, ClientError> {
        self.submit(SubmitRequest {
            dataset,
            force_field,
            options,
            replicates,
            priority: Default::default(),
        })
        .await
    }

    /// Submit a fully specified request.
    pub async fn submit(&self, request: SubmitRequest) -> Result<RequestHandle, ClientError> {
        let url = format!("{}/requests", self.base_url);
        let res = self.client.post(&url).json(&request).send().await?;
        let data: SubmitData = read_envelope(res).await?;
        debug!(
            request_id = %data.request_id,
            work_items = data.work_items,
            "request submitted"
        );
        Ok(RequestHandle {
            client: self.clone(),
            request_id: data.request_id,
            work_items: data.work_items,
        })
    }

    pub async fn status(&self, request_id: &str) -> Result<RequestStatusData, ClientError> {
        let url = format!("{}/requests/status", self.base_url);
        let res = self
            .client
            .get(&url)
            .query(&[("request_id", request_id)])
            .send()
            .await?;
        read_envelope(res).await
    }

    pub async fn backend_status(&self) -> Result<BackendStatus, ClientError> {
        let url = format!("{}/backend/status", self.base_url);
        let res = self.client.get(&url).send().await?;
        read_envelope(res).await
    }

    /// Handle for a request submitted earlier, e.g. by another process.
    pub fn handle(&self, request_id: impl Into<String>) -> RequestHandle {
        RequestHandle {
            client: self.clone(),
            request_id: request_id.into(),
            work_items: 0,
        }
    }
}

async fn read_envelope<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, ClientError> {
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let parsed: BaseResponse<T> = serde_json::from_str(&body)?;
    if parsed.code != 200 {
        return Err(ClientError::Server {
            code: parsed.code,
            message: parsed.message,
        });
    }
    parsed.data.ok_or(ClientError::EmptyResponse)
}

/// A submitted request. Dropping it does not cancel the work on the server.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    client: EstimationClient,
    request_id: String,
    work_items: usize,
}

impl RequestHandle {
    pub fn id(&self) -> &str {
        &self.request_id
    }

    /// Number of work items the server created for this request (0 for reattached handles).
    pub fn work_items(&self) -> usize {
        self.work_items
    }

    /// Fetch the result. With `synchronous` set, poll every `polling_interval` until the
    /// request is terminal; otherwise return `Ok(None)` if it is still in progress.
    /// A faulted request is an error.
    pub async fn results(
        &self,
        synchronous: bool,
        polling_interval: Duration,
    ) -> Result<Option<RequestResult>, ClientError> {
        loop {
            if let Some(result) = self.poll().await? {
                return Ok(Some(result));
            }
            if !synchronous {
                return Ok(None);
            }
            tokio::time::sleep(polling_interval).await;
        }
    }

    /// Synchronous wait bounded by `timeout`.
    pub async fn results_with_timeout(
        &self,
        polling_interval: Duration,
        timeout: Duration,
    ) -> Result<RequestResult, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.poll().await? {
                return Ok(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout {
                    request_id: self.request_id.clone(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(polling_interval.min(deadline - now)).await;
        }
    }

    async fn poll(&self) -> Result<Option<RequestResult>, ClientError> {
        let status = self.client.status(&self.request_id).await?;
        debug!(
            request_id = %self.request_id,
            status = ?status.status,
            finished = status.progress.terminal(),
            total = status.progress.total(),
            "polled request"
        );
        match status.status {
            RequestStatus::Pending | RequestStatus::Running => Ok(None),
            RequestStatus::Faulted => Err(ClientError::Faulted {
                request_id: self.request_id.clone(),
                message: status.error.unwrap_or_default(),
            }),
            RequestStatus::Completed => status.result.map(Some).ok_or(ClientError::EmptyResponse),
        }
    }
}
