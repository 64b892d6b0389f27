//! Elastic pool behaviour against the in-memory queue.

use async_trait::async_trait;
use prop_backend::{
    AllocationSpec, AllocationState, MockEstimator, MockQueue, QueueError, QueuePool,
    QueuePoolConfig, QueueSystem, QueueWorkerResources,
};
use prop_types::{
    BackendError, CalculationBackend, ComputeTask, EstimationSchema, Priority, PropertyType,
    TaskOutcome, WorkItem,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn task(id: &str) -> ComputeTask {
    ComputeTask {
        task_id: id.to_string(),
        cache_key: id.to_string(),
        work_item: WorkItem {
            id: id.to_string(),
            property_type: PropertyType::Density,
            parameters: json!({"value": 0.99}),
            replicate: 1,
            force_field: "openff-2.2.1".to_string(),
            force_field_hash: "hash".to_string(),
        },
        schema: EstimationSchema::default(),
        working_directory: std::env::temp_dir(),
        priority: Priority::Normal,
    }
}

fn config(min_workers: usize, max_workers: usize) -> QueuePoolConfig {
    QueuePoolConfig {
        min_workers,
        max_workers,
        adaptive_interval_ms: 10,
        resources_per_worker: QueueWorkerResources {
            wallclock_time_limit: "01:00:00".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Grants allocations immediately but acknowledges them late.
struct SlowAcknowledge {
    inner: Arc<MockQueue>,
    delay: Duration,
}

#[async_trait]
impl QueueSystem for SlowAcknowledge {
    fn name(&self) -> &str {
        "slow-ack"
    }

    async fn submit(&self, spec: &AllocationSpec) -> Result<String, QueueError> {
        let id = self.inner.submit(spec).await?;
        tokio::time::sleep(self.delay).await;
        Ok(id)
    }

    async fn state(&self, allocation_id: &str) -> Result<AllocationState, QueueError> {
        self.inner.state(allocation_id).await
    }

    async fn cancel(&self, allocation_id: &str) -> Result<(), QueueError> {
        self.inner.cancel(allocation_id).await
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn scales_between_bounds_and_back_down() {
    let queue = Arc::new(MockQueue::new());
    let estimator = Arc::new(MockEstimator::new().with_delay(Duration::from_millis(30)));
    let pool = QueuePool::new(config(1, 3), queue.clone(), estimator.clone()).unwrap();
    pool.start().await.unwrap();
    assert_eq!(queue.live(), 1);

    let mut handles = Vec::new();
    for i in 0..12 {
        handles.push(pool.submit(task(&format!("p{i}"))).await.unwrap());
    }
    for handle in handles {
        assert!(matches!(handle.outcome().await, TaskOutcome::Succeeded(_)));
    }
    assert_eq!(estimator.calls(), 12);
    assert!(queue.max_live() <= 3, "max live was {}", queue.max_live());
    assert!(queue.max_live() > 1, "pool never scaled up");
    assert!(estimator.max_in_flight() <= 3);

    wait_until(|| queue.live() == 1).await;
    pool.stop().await.unwrap();
    assert_eq!(queue.live(), 0);
}

#[tokio::test]
async fn start_waits_for_min_workers() {
    let queue = Arc::new(MockQueue::new());
    queue.hold_pending(true);
    let pool = Arc::new(
        QueuePool::new(config(2, 2), queue.clone(), Arc::new(MockEstimator::new())).unwrap(),
    );

    let starter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.start().await })
    };
    wait_until(|| queue.submitted() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!starter.is_finished());
    assert!(matches!(
        pool.submit(task("early")).await,
        Err(BackendError::NotStarted)
    ));

    queue.grant_all();
    starter.await.unwrap().unwrap();
    assert_eq!(pool.status().await.slots.idle, 2);
}

#[tokio::test]
async fn start_fails_when_provisioning_keeps_failing() {
    let queue = Arc::new(MockQueue::new());
    queue.reject_all();
    let mut config = config(1, 2);
    config.max_provision_attempts = 2;
    let pool = QueuePool::new(config, queue, Arc::new(MockEstimator::new())).unwrap();
    assert!(matches!(
        pool.start().await,
        Err(BackendError::Provisioning(_))
    ));
}

#[tokio::test]
async fn provisioning_failure_after_start_resolves_every_task() {
    let queue = Arc::new(MockQueue::new());
    let mut config = config(0, 2);
    config.max_provision_attempts = 3;
    let pool = QueuePool::new(config, queue.clone(), Arc::new(MockEstimator::new())).unwrap();
    pool.start().await.unwrap();

    queue.reject_all();
    let first = pool.submit(task("a")).await.unwrap();
    let second = pool.submit(task("b")).await.unwrap();
    assert!(matches!(first.outcome().await, TaskOutcome::BackendFatal(_)));
    assert!(matches!(second.outcome().await, TaskOutcome::BackendFatal(_)));

    let late = pool.submit(task("c")).await.unwrap();
    assert!(matches!(late.outcome().await, TaskOutcome::BackendFatal(_)));
    assert!(pool.status().await.fatal.is_some());
}

#[tokio::test]
async fn lost_worker_requeues_task_once() {
    let queue = Arc::new(MockQueue::new());
    let estimator = Arc::new(MockEstimator::gated());
    let pool = QueuePool::new(config(1, 1), queue.clone(), estimator.clone()).unwrap();
    pool.start().await.unwrap();

    let handle = pool.submit(task("preempted")).await.unwrap();
    wait_until(|| estimator.in_flight() == 1).await;
    let allocation = queue.running_allocations().pop().unwrap();
    queue.set_state(&allocation, AllocationState::Preempted);

    wait_until(|| estimator.calls() == 2 && estimator.in_flight() == 1).await;
    estimator.open_gate(1);
    assert!(matches!(handle.outcome().await, TaskOutcome::Succeeded(_)));
    assert_eq!(estimator.calls_for("preempted"), 2);
    assert!(queue.max_live() <= 1);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn second_worker_loss_fails_the_task() {
    let queue = Arc::new(MockQueue::new());
    let estimator = Arc::new(MockEstimator::gated());
    let pool = QueuePool::new(config(1, 1), queue.clone(), estimator.clone()).unwrap();
    pool.start().await.unwrap();

    let handle = pool.submit(task("unlucky")).await.unwrap();
    for attempt in 1..=2 {
        wait_until(|| estimator.calls() == attempt && estimator.in_flight() == 1).await;
        let allocation = queue.running_allocations().pop().unwrap();
        queue.set_state(&allocation, AllocationState::Failed("NODE_FAIL".to_string()));
    }
    match handle.outcome().await {
        TaskOutcome::Failed(reason) => assert!(reason.contains("worker lost twice")),
        other => panic!("unexpected outcome {other:?}"),
    }
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn stop_releases_allocations_and_resolves_tasks() {
    let queue = Arc::new(MockQueue::new());
    let estimator = Arc::new(MockEstimator::gated());
    let pool = QueuePool::new(config(2, 2), queue.clone(), estimator.clone()).unwrap();
    pool.start().await.unwrap();

    let handles = vec![
        pool.submit(task("a")).await.unwrap(),
        pool.submit(task("b")).await.unwrap(),
        pool.submit(task("c")).await.unwrap(),
    ];
    wait_until(|| estimator.in_flight() == 2).await;
    pool.stop().await.unwrap();
    for handle in handles {
        assert!(matches!(handle.outcome().await, TaskOutcome::Errored(_)));
    }
    assert_eq!(queue.live(), 0);
    assert_eq!(queue.max_live(), 2);
    assert!(matches!(pool.submit(task("d")).await, Err(BackendError::Stopped)));
}

#[tokio::test]
async fn stop_during_a_slow_allocation_request_releases_it() {
    let queue = Arc::new(MockQueue::new());
    let slow = Arc::new(SlowAcknowledge {
        inner: queue.clone(),
        delay: Duration::from_millis(200),
    });
    let pool = QueuePool::new(config(0, 1), slow, Arc::new(MockEstimator::new())).unwrap();
    pool.start().await.unwrap();

    let handle = pool.submit(task("a")).await.unwrap();
    wait_until(|| queue.submitted() == 1).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    pool.stop().await.unwrap();

    assert_eq!(queue.live(), 0);
    assert_eq!(queue.max_live(), 1);
    assert!(matches!(handle.outcome().await, TaskOutcome::Errored(_)));
}

#[tokio::test]
async fn dropping_a_pool_releases_its_allocations() {
    let queue = Arc::new(MockQueue::new());
    let pool = QueuePool::new(config(2, 2), queue.clone(), Arc::new(MockEstimator::new())).unwrap();
    pool.start().await.unwrap();
    assert_eq!(queue.live(), 2);

    drop(pool);
    wait_until(|| queue.live() == 0).await;
}
