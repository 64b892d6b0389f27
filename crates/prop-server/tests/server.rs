//! End-to-end request handling against a local pool.

use async_trait::async_trait;
use prop_backend::{LocalPool, LocalPoolConfig, MockEstimator};
use prop_cache::InMemoryCache;
use prop_server::{EstimationServer, ServerConfig, ServerError};
use prop_types::{
    CalculationBackend, ComputeTask, DataSet, Estimate, EstimationError, EstimationSchema,
    Estimator, ForceFieldSource, PhysicalProperty, PropertyType, RequestOptions, RequestStatus,
    ResultCache, SlotContext, SubmitRequest,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn property(id: &str, parameters: serde_json::Value) -> PhysicalProperty {
    PhysicalProperty {
        id: id.to_string(),
        property_type: PropertyType::Density,
        value: 1.0,
        uncertainty: 0.01,
        parameters,
    }
}

fn submit(properties: Vec<PhysicalProperty>, replicates: Vec<u32>) -> SubmitRequest {
    SubmitRequest {
        dataset: DataSet::new(properties),
        force_field: ForceFieldSource::new("openff-2.2.1", "<SMIRNOFF version=\"0.3\"/>"),
        options: RequestOptions::default(),
        replicates,
        priority: Default::default(),
    }
}

fn config(dir: &std::path::Path) -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        working_directory: dir.join("working-directory"),
        ..Default::default()
    }
}

async fn server_with(
    estimator: Arc<dyn Estimator>,
    workers: usize,
    dir: &std::path::Path,
) -> (EstimationServer, Arc<InMemoryCache>) {
    let backend = Arc::new(LocalPool::new(
        LocalPoolConfig {
            number_of_workers: workers,
            ..Default::default()
        },
        estimator,
    ));
    backend.start().await.unwrap();
    let cache = Arc::new(InMemoryCache::new());
    let server = EstimationServer::new(config(dir), backend, cache.clone());
    (server, cache)
}

#[tokio::test]
async fn valid_and_invalid_items_are_partitioned() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with(Arc::new(MockEstimator::new()), 2, dir.path()).await;

    let id = server
        .request_estimate(submit(
            vec![
                property("A", json!({"value": 0.997})),
                property("B", json!({"outcome": "crash"})),
            ],
            vec![1],
        ))
        .await
        .unwrap();
    let status = server.wait_for(&id).await.unwrap();
    assert_eq!(status.status, RequestStatus::Completed);
    let result = status.result.unwrap();
    assert_eq!(result.estimated.len(), 1);
    assert_eq!(result.estimated[0].id, "A");
    assert_eq!(result.estimated[0].value, 0.997);
    assert!(result.unsuccessful.is_empty());
    assert_eq!(result.exceptions.len(), 1);
    assert_eq!(result.exceptions[0].id, "B");
    assert_eq!(status.progress.total(), 2);
    assert_eq!(status.progress.terminal(), 2);
}

#[tokio::test]
async fn every_work_item_lands_in_exactly_one_set() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with(Arc::new(MockEstimator::new()), 3, dir.path()).await;
    let request = submit(
        vec![
            property("ok", json!({"value": 2.0})),
            property("fail", json!({"outcome": "fail"})),
            property("crash", json!({"outcome": "crash"})),
        ],
        vec![1, 2],
    );
    let id = server.request_estimate(request.clone()).await.unwrap();
    let result = server.wait_for(&id).await.unwrap().result.unwrap();

    let expected: Vec<_> = prop_server::decompose(&request)
        .unwrap()
        .iter()
        .map(|w| w.key())
        .collect();
    result.verify_partition(&expected).unwrap();
    assert_eq!(result.len(), 6);
    assert_eq!(result.estimated.len(), 2);
    assert_eq!(result.unsuccessful.len(), 2);
    assert_eq!(result.exceptions.len(), 2);
}

#[tokio::test]
async fn concurrent_identical_items_run_once() {
    let dir = tempfile::tempdir().unwrap();
    let estimator = Arc::new(MockEstimator::gated());
    let (server, cache) = server_with(estimator.clone(), 4, dir.path()).await;

    // different ids, same determining inputs
    let first = server
        .request_estimate(submit(vec![property("w1", json!({"smiles": "O"}))], vec![1]))
        .await
        .unwrap();
    let second = server
        .request_estimate(submit(vec![property("w2", json!({"smiles": "O"}))], vec![1]))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while estimator.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    estimator.open_gate(1);

    let a = server.wait_for(&first).await.unwrap().result.unwrap();
    let b = server.wait_for(&second).await.unwrap().result.unwrap();
    assert_eq!(estimator.calls(), 1);
    assert_eq!(a.estimated.len() + b.estimated.len(), 2);
    assert_eq!(a.estimated[0].cache_key, b.estimated[0].cache_key);
    let computed = [&a, &b]
        .iter()
        .filter(|r| !r.estimated[0].from_cache)
        .count();
    assert_eq!(computed, 1);
    assert_eq!(cache.len().await.unwrap(), 1);
}

#[tokio::test]
async fn later_requests_reuse_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let estimator = Arc::new(MockEstimator::new());
    let (server, _) = server_with(estimator.clone(), 1, dir.path()).await;
    let request = submit(vec![property("d1", json!({"smiles": "CCO"}))], vec![1, 2]);

    let first = server.request_estimate(request.clone()).await.unwrap();
    server.wait_for(&first).await.unwrap();
    assert_eq!(estimator.calls(), 2);

    let again = server.request_estimate(request).await.unwrap();
    let result = server.wait_for(&again).await.unwrap().result.unwrap();
    assert_eq!(estimator.calls(), 2);
    assert!(result.estimated.iter().all(|p| p.from_cache));
}

#[tokio::test]
async fn error_on_failure_aborts_the_property_chain() {
    let dir = tempfile::tempdir().unwrap();
    let estimator = Arc::new(MockEstimator::new().with_delay(Duration::from_millis(50)));
    let (server, _) = server_with(estimator, 1, dir.path()).await;

    let mut request = submit(
        vec![
            property("bad", json!({"outcome": "fail"})),
            property("good", json!({"value": 1.1})),
        ],
        vec![1, 2, 3],
    );
    request.options.add_schema(
        PropertyType::Density,
        EstimationSchema {
            error_on_failure: true,
            ..Default::default()
        },
    );
    let id = server.request_estimate(request).await.unwrap();
    let result = server.wait_for(&id).await.unwrap().result.unwrap();

    assert_eq!(result.exceptions.len(), 1);
    assert_eq!(result.exceptions[0].id, "bad");
    assert_eq!(result.unsuccessful.len(), 2);
    assert!(result
        .unsuccessful
        .iter()
        .all(|p| p.id == "bad" && p.reason.starts_with("aborted")));
    assert_eq!(result.estimated.len(), 3);
    assert!(result.estimated.iter().all(|p| p.id == "good"));
}

#[tokio::test]
async fn failures_without_escalation_leave_siblings_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with(Arc::new(MockEstimator::new()), 2, dir.path()).await;
    let id = server
        .request_estimate(submit(
            vec![property("bad", json!({"outcome": "fail"}))],
            vec![1, 2, 3],
        ))
        .await
        .unwrap();
    let result = server.wait_for(&id).await.unwrap().result.unwrap();
    assert_eq!(result.unsuccessful.len(), 3);
    assert!(result.exceptions.is_empty());
}

#[tokio::test]
async fn dead_backend_faults_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(LocalPool::new(
        LocalPoolConfig::default(),
        Arc::new(MockEstimator::new()),
    ));
    backend.start().await.unwrap();
    backend.stop().await.unwrap();
    let server = EstimationServer::new(
        config(dir.path()),
        backend,
        Arc::new(InMemoryCache::new()),
    );

    let id = server
        .request_estimate(submit(vec![property("p", json!({}))], vec![1]))
        .await
        .unwrap();
    let status = server.wait_for(&id).await.unwrap();
    assert_eq!(status.status, RequestStatus::Faulted);
    assert!(status.result.is_none());
    assert!(status.error.unwrap().contains("stopped"));
}

#[tokio::test]
async fn retrieved_requests_are_collected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(LocalPool::new(
        LocalPoolConfig::default(),
        Arc::new(MockEstimator::new()),
    ));
    backend.start().await.unwrap();
    let mut config = config(dir.path());
    config.request_retention_secs = 0;
    let server = EstimationServer::new(config, backend, Arc::new(InMemoryCache::new()));

    let id = server
        .request_estimate(submit(vec![property("p", json!({}))], vec![1]))
        .await
        .unwrap();
    let mut rx_status = server.status(&id).await.unwrap().status;
    while !rx_status.is_terminal() {
        tokio::time::sleep(Duration::from_millis(5)).await;
        rx_status = server.status(&id).await.unwrap().status;
    }
    assert_eq!(server.collect_garbage().await, 1);
    assert!(matches!(
        server.status(&id).await,
        Err(ServerError::NotFound(_))
    ));
}

#[tokio::test]
async fn unretrieved_requests_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with(Arc::new(MockEstimator::new()), 1, dir.path()).await;
    server
        .request_estimate(submit(vec![property("p", json!({}))], vec![1]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.collect_garbage().await, 0);
    assert_eq!(server.request_count().await, 1);
}

/// Writes a marker into its working directory so cleanup can be observed.
struct ScratchEstimator;

#[async_trait]
impl Estimator for ScratchEstimator {
    async fn estimate(
        &self,
        task: &ComputeTask,
        _slot: &SlotContext,
    ) -> Result<Estimate, EstimationError> {
        tokio::fs::create_dir_all(&task.working_directory)
            .await
            .map_err(|e| EstimationError::Crashed(e.to_string()))?;
        tokio::fs::write(task.working_directory.join("trajectory.dcd"), b"frames")
            .await
            .map_err(|e| EstimationError::Crashed(e.to_string()))?;
        Ok(Estimate {
            value: 0.5,
            uncertainty: 0.05,
            iterations: 1,
        })
    }
}

#[tokio::test]
async fn working_files_follow_the_delete_setting() {
    for delete in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalPool::new(
            LocalPoolConfig::default(),
            Arc::new(ScratchEstimator),
        ));
        backend.start().await.unwrap();
        let mut config = config(dir.path());
        config.delete_working_files = delete;
        let server = EstimationServer::new(config, backend, Arc::new(InMemoryCache::new()));

        let id = server
            .request_estimate(submit(vec![property("p", json!({}))], vec![1]))
            .await
            .unwrap();
        let result = server.wait_for(&id).await.unwrap().result.unwrap();
        let scratch = dir
            .path()
            .join("working-directory")
            .join(&result.estimated[0].cache_key);
        assert_eq!(scratch.exists(), !delete);
    }
}
