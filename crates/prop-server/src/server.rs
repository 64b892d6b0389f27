//! Estimation server context: owns the backend and cache handles, decomposes requests into
//! work items, and drives each item to a terminal state.

use crate::coalesce::{follow, Flight, SingleFlight};
use crate::tracker::{ItemOutcome, RequestRecord};
use crate::{router, ServerConfig, ServerError};
use prop_cache::cache_key;
use prop_types::{
    BackendStatus, CacheEntry, CacheKey, CalculationBackend, ComputeTask, Estimate,
    EstimationSchema, Request, RequestStatus, RequestStatusData, ResultCache, SubmitRequest,
    TaskOutcome, TaskPhase, WorkItem, WorkItemState,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct HttpRuntime {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    serve: JoinHandle<std::io::Result<()>>,
    gc: JoinHandle<()>,
}

struct ServerInner {
    config: ServerConfig,
    backend: Arc<dyn CalculationBackend>,
    cache: Arc<dyn ResultCache>,
    requests: RwLock<HashMap<String, RequestRecord>>,
    flights: SingleFlight,
    http: Mutex<Option<HttpRuntime>>,
}

/// Long-lived estimation context. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EstimationServer {
    inner: Arc<ServerInner>,
}

/// Build the work items of a submission: every property once per replicate.
pub fn decompose(submit: &SubmitRequest) -> Result<Vec<WorkItem>, ServerError> {
    if submit.replicates.is_empty() {
        return Err(ServerError::InvalidRequest(
            "at least one replicate is required".to_string(),
        ));
    }
    let mut replicates = HashSet::new();
    for replicate in &submit.replicates {
        if !replicates.insert(*replicate) {
            return Err(ServerError::InvalidRequest(format!(
                "replicate {replicate} listed twice"
            )));
        }
    }
    let mut ids = HashSet::new();
    for property in &submit.dataset.properties {
        if !ids.insert(property.id.as_str()) {
            return Err(ServerError::InvalidRequest(format!(
                "property id {} appears twice in the dataset",
                property.id
            )));
        }
    }
    let force_field_hash = submit.force_field.content_hash();
    Ok(submit
        .replicates
        .iter()
        .flat_map(|replicate| {
            let force_field_hash = &force_field_hash;
            submit.dataset.properties.iter().map(move |property| WorkItem {
                id: property.id.clone(),
                property_type: property.property_type,
                parameters: property.parameters.clone(),
                replicate: *replicate,
                force_field: submit.force_field.name.clone(),
                force_field_hash: force_field_hash.clone(),
            })
        })
        .collect())
}

impl EstimationServer {
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn CalculationBackend>,
        cache: Arc<dyn ResultCache>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                backend,
                cache,
                requests: RwLock::new(HashMap::new()),
                flights: SingleFlight::default(),
                http: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Bind the configured port, serve the HTTP API and start request garbage collection.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut http = self.inner.http.lock().await;
        if http.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let config = &self.inner.config;
        tokio::fs::create_dir_all(&config.working_directory).await?;
        let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = router(self.clone());
        let serve = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        let gc = tokio::spawn(run_gc(Arc::downgrade(&self.inner)));
        info!(%addr, "estimation server listening");
        *http = Some(HttpRuntime {
            addr,
            shutdown,
            serve,
            gc,
        });
        Ok(addr)
    }

    /// Address the HTTP API is bound to, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.http.lock().await.as_ref().map(|h| h.addr)
    }

    /// Stop serving HTTP. In-flight requests keep running until the backend is stopped.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(http) = self.inner.http.lock().await.take() else {
            return Ok(());
        };
        http.gc.abort();
        let _ = http.shutdown.send(());
        match http.serve.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "http server ended with an error"),
            Err(e) => warn!(error = %e, "http server task failed"),
        }
        info!(addr = %http.addr, "estimation server stopped");
        Ok(())
    }

    /// Accept a submission; returns the request id immediately.
    pub async fn request_estimate(&self, submit: SubmitRequest) -> Result<String, ServerError> {
        let work_items = decompose(&submit)?;
        let request = Request {
            id: Uuid::new_v4().to_string(),
            work_items,
            options: submit.options,
            priority: submit.priority,
            submitted_at: chrono::Utc::now().to_rfc3339(),
        };
        let request_id = request.id.clone();
        let count = request.work_items.len();
        self.inner
            .requests
            .write()
            .await
            .insert(request_id.clone(), RequestRecord::new(request));
        info!(
            request_id = %request_id,
            work_items = count,
            force_field = %submit.force_field.name,
            "request accepted"
        );
        tokio::spawn(Arc::clone(&self.inner).drive(request_id.clone(), count));
        Ok(request_id)
    }

    /// Current state of a request. A terminal status counts as retrieved for garbage collection.
    pub async fn status(&self, request_id: &str) -> Result<RequestStatusData, ServerError> {
        let mut requests = self.inner.requests.write().await;
        let record = requests
            .get_mut(request_id)
            .ok_or_else(|| ServerError::NotFound(request_id.to_string()))?;
        if record.status().is_terminal() && record.retrieved_at.is_none() {
            record.retrieved_at = Some(tokio::time::Instant::now());
        }
        Ok(record.status_data())
    }

    /// Wait until a request is terminal and return its final status.
    pub async fn wait_for(&self, request_id: &str) -> Result<RequestStatusData, ServerError> {
        let mut rx = {
            let requests = self.inner.requests.read().await;
            requests
                .get(request_id)
                .ok_or_else(|| ServerError::NotFound(request_id.to_string()))?
                .subscribe()
        };
        // the record cannot be collected before it is retrieved, so the sender outlives this wait
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.status(request_id).await
    }

    pub async fn backend_status(&self) -> BackendStatus {
        self.inner.backend.status().await
    }

    /// Drop retrieved requests older than the retention period; returns how many were dropped.
    pub async fn collect_garbage(&self) -> usize {
        self.inner.collect_garbage().await
    }

    pub async fn request_count(&self) -> usize {
        self.inner.requests.read().await.len()
    }
}

async fn run_gc(inner: Weak<ServerInner>) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.gc_interval(),
        None => return,
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.collect_garbage().await;
    }
}

impl ServerInner {
    async fn collect_garbage(&self) -> usize {
        let retention = self.config.request_retention();
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, record| {
            !record
                .retrieved_at
                .is_some_and(|retrieved| retrieved.elapsed() >= retention)
        });
        let removed = before - requests.len();
        if removed > 0 {
            debug!(removed, "collected retrieved requests");
        }
        removed
    }

    async fn drive(self: Arc<Self>, request_id: String, count: usize) {
        let mut items = JoinSet::new();
        for index in 0..count {
            items.spawn(Arc::clone(&self).run_item(request_id.clone(), index));
        }
        while let Some(joined) = items.join_next().await {
            if let Err(e) = joined {
                error!(request_id = %request_id, error = %e, "work item task failed");
            }
        }
        self.finalize(&request_id).await;
    }

    async fn finalize(&self, request_id: &str) {
        let mut requests = self.requests.write().await;
        let Some(record) = requests.get_mut(request_id) else {
            return;
        };
        for index in record.unfinished() {
            record.resolve(
                index,
                WorkItemState::Errored,
                ItemOutcome::Exception("work item did not complete".to_string()),
            );
        }
        let result = record.build_result();
        let expected: Vec<_> = record.request.work_items.iter().map(|w| w.key()).collect();
        if let Err(e) = result.verify_partition(&expected) {
            error!(request_id, error = %e, "request result is not a partition of its work items");
        }
        let (estimated, unsuccessful, exceptions) = (
            result.estimated.len(),
            result.unsuccessful.len(),
            result.exceptions.len(),
        );
        match record.finish(result) {
            RequestStatus::Faulted => error!(
                request_id,
                error = record.fault.as_deref().unwrap_or_default(),
                "request faulted"
            ),
            _ => info!(
                request_id,
                estimated, unsuccessful, exceptions, "request completed"
            ),
        }
    }

    async fn run_item(self: Arc<Self>, request_id: String, index: usize) {
        let context = {
            let requests = self.requests.read().await;
            requests.get(&request_id).and_then(|record| {
                let item = record.request.work_items.get(index)?.clone();
                let schema = record.request.options.schema_for(item.property_type).clone();
                let signal = record.chain_signal(index)?;
                Some((item, schema, record.request.priority, signal))
            })
        };
        let Some((item, schema, priority, mut aborted)) = context else {
            return;
        };
        let key = cache_key(&item, &schema);

        let estimate = self.estimate_item(&request_id, index, &item, &schema, &key, priority);
        let chain_aborted = async {
            let closed = aborted.wait_for(|aborted| *aborted).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        };
        let (outcome, shared) = tokio::select! {
            done = estimate => done,
            _ = chain_aborted => {
                debug!(request_id = %request_id, item = %item.key(), "property chain aborted");
                return;
            }
        };
        self.record_outcome(&request_id, index, &item, &schema, key, outcome, shared)
            .await;
    }

    async fn transition(&self, request_id: &str, index: usize, next: WorkItemState) {
        if let Some(record) = self.requests.write().await.get_mut(request_id) {
            record.transition(index, next);
        }
    }

    async fn cached(&self, key: &CacheKey) -> Option<Estimate> {
        match self.cache.get(key).await {
            Ok(entry) => entry.map(|e| e.payload),
            Err(e) => {
                warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Resolve one item through cache, single-flight and backend. The flag is true when the
    /// estimate was not computed by this call.
    async fn estimate_item(
        &self,
        request_id: &str,
        index: usize,
        item: &WorkItem,
        schema: &EstimationSchema,
        key: &CacheKey,
        priority: prop_types::Priority,
    ) -> (TaskOutcome, bool) {
        if let Some(estimate) = self.cached(key).await {
            debug!(item = %item.key(), key = %key, "cache hit");
            return (TaskOutcome::Succeeded(estimate), true);
        }
        loop {
            match self.flights.join(key) {
                Flight::Follower(rx) => {
                    debug!(item = %item.key(), key = %key, "joining in-flight computation");
                    if let Some(outcome) = follow(rx).await {
                        return (outcome, true);
                    }
                }
                Flight::Leader(leader) => {
                    if let Some(estimate) = self.cached(key).await {
                        leader.complete(TaskOutcome::Succeeded(estimate.clone()));
                        return (TaskOutcome::Succeeded(estimate), true);
                    }
                    let outcome = self
                        .compute(request_id, index, item, schema, key, priority)
                        .await;
                    if let TaskOutcome::Succeeded(estimate) = &outcome {
                        if let Err(e) = self
                            .cache
                            .put(CacheEntry::new(key.clone(), estimate.clone()))
                            .await
                        {
                            warn!(key = %key, error = %e, "failed to store estimate in cache");
                        }
                    }
                    leader.complete(outcome.clone());
                    return (outcome, false);
                }
            }
        }
    }

    async fn compute(
        &self,
        request_id: &str,
        index: usize,
        item: &WorkItem,
        schema: &EstimationSchema,
        key: &CacheKey,
        priority: prop_types::Priority,
    ) -> TaskOutcome {
        let working_directory = self.config.working_directory.join(key.as_str());
        let task = ComputeTask {
            task_id: format!("{request_id}-{index}"),
            cache_key: key.to_string(),
            work_item: item.clone(),
            schema: schema.clone(),
            working_directory: working_directory.clone(),
            priority,
        };
        self.transition(request_id, index, WorkItemState::Dispatched)
            .await;
        let mut handle = match self.backend.submit(task).await {
            Ok(handle) => handle,
            Err(e) => return TaskOutcome::BackendFatal(e.to_string()),
        };
        let outcome = loop {
            match handle.next_phase().await {
                TaskPhase::Queued => {}
                TaskPhase::Running => {
                    self.transition(request_id, index, WorkItemState::Running)
                        .await
                }
                TaskPhase::Finished(outcome) => break outcome,
            }
        };
        if self.config.delete_working_files {
            match tokio::fs::remove_dir_all(&working_directory).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %working_directory.display(),
                    error = %e,
                    "failed to delete working files"
                ),
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_outcome(
        &self,
        request_id: &str,
        index: usize,
        item: &WorkItem,
        schema: &EstimationSchema,
        key: CacheKey,
        outcome: TaskOutcome,
        shared: bool,
    ) {
        let mut requests = self.requests.write().await;
        let Some(record) = requests.get_mut(request_id) else {
            return;
        };
        match outcome {
            TaskOutcome::Succeeded(estimate) => {
                record.resolve(
                    index,
                    WorkItemState::Succeeded,
                    ItemOutcome::Estimated {
                        estimate,
                        cache_key: key,
                        from_cache: shared,
                    },
                );
            }
            TaskOutcome::Failed(reason) if schema.error_on_failure => {
                let escalated = record.resolve(
                    index,
                    WorkItemState::Errored,
                    ItemOutcome::Exception(format!(
                        "estimate failed with error_on_failure set: {reason}"
                    )),
                );
                if escalated {
                    let aborted =
                        record.abort_chain(&item.id, &format!("aborted: {} failed", item.key()));
                    warn!(request_id, item = %item.key(), aborted, "failure escalated, property chain aborted");
                }
            }
            TaskOutcome::Failed(reason) => {
                debug!(request_id, item = %item.key(), reason = %reason, "estimate unsuccessful");
                record.resolve(
                    index,
                    WorkItemState::Failed,
                    ItemOutcome::Unsuccessful(reason),
                );
            }
            TaskOutcome::Errored(message) => {
                warn!(request_id, item = %item.key(), error = %message, "estimation error");
                record.resolve(
                    index,
                    WorkItemState::Errored,
                    ItemOutcome::Exception(message),
                );
            }
            TaskOutcome::BackendFatal(message) => {
                if record.fault.is_none() {
                    record.fault = Some(message.clone());
                }
                record.resolve(
                    index,
                    WorkItemState::Errored,
                    ItemOutcome::Exception(message),
                );
            }
        }
    }
}
