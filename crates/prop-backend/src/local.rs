//! Fixed-size pool of in-process workers.

use crate::execute;
use crate::task_queue::{PendingTask, TaskQueue};
use async_trait::async_trait;
use prop_types::{
    BackendError, BackendStatus, CalculationBackend, ComputeResources, ComputeTask, Estimator,
    SlotContext, SlotCounts, SlotState, TaskHandle,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPoolConfig {
    #[serde(default = "default_workers")]
    pub number_of_workers: usize,
    #[serde(default)]
    pub resources_per_worker: ComputeResources,
    /// Per-task wall-clock ceiling in seconds.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

fn default_workers() -> usize {
    1
}

impl Default for LocalPoolConfig {
    fn default() -> Self {
        Self {
            number_of_workers: default_workers(),
            resources_per_worker: ComputeResources::default(),
            task_timeout_secs: None,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
}

struct Shared {
    queue: Mutex<TaskQueue>,
    notify: Notify,
    slots: RwLock<Vec<SlotState>>,
    completed: AtomicU64,
}

impl Shared {
    async fn set_slot(&self, index: usize, state: SlotState) {
        if let Some(slot) = self.slots.write().await.get_mut(index) {
            *slot = state;
        }
    }
}

/// Local pool: `number_of_workers` tokio tasks pulling from one priority queue.
pub struct LocalPool {
    config: LocalPoolConfig,
    estimator: Arc<dyn Estimator>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalPool {
    pub fn new(config: LocalPoolConfig, estimator: Arc<dyn Estimator>) -> Self {
        let slots = vec![SlotState::Pending; config.number_of_workers.max(1)];
        Self {
            config,
            estimator,
            shared: Arc::new(Shared {
                queue: Mutex::new(TaskQueue::default()),
                notify: Notify::new(),
                slots: RwLock::new(slots),
                completed: AtomicU64::new(0),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            workers: Mutex::new(Vec::new()),
        }
    }
}

async fn run_worker(
    index: usize,
    shared: Arc<Shared>,
    estimator: Arc<dyn Estimator>,
    context: SlotContext,
    ceiling: Option<Duration>,
) {
    loop {
        let next = shared.queue.lock().await.pop();
        let Some(pending) = next else {
            shared.notify.notified().await;
            continue;
        };
        shared.set_slot(index, SlotState::Busy).await;
        debug!(slot = %context.slot_id, task_id = %pending.task.task_id, "running task");
        pending.reporter.running();
        let outcome = execute(estimator.as_ref(), &pending.task, &context, ceiling).await;
        pending.finish(outcome);
        shared.completed.fetch_add(1, Ordering::Relaxed);
        shared.set_slot(index, SlotState::Idle).await;
    }
}

#[async_trait]
impl CalculationBackend for LocalPool {
    async fn start(&self) -> Result<(), BackendError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return Err(BackendError::Stopped);
        }
        if lifecycle.started {
            return Ok(());
        }
        let ceiling = self.config.task_timeout_secs.map(Duration::from_secs);
        let count = self.shared.slots.read().await.len();
        let mut workers = self.workers.lock().await;
        for index in 0..count {
            let context = SlotContext {
                slot_id: format!("local-{index}"),
                allocation_id: None,
                resources: self.config.resources_per_worker.clone(),
            };
            self.shared.set_slot(index, SlotState::Idle).await;
            workers.push(tokio::spawn(run_worker(
                index,
                Arc::clone(&self.shared),
                Arc::clone(&self.estimator),
                context,
                ceiling,
            )));
        }
        lifecycle.started = true;
        info!(workers = count, "local pool started");
        Ok(())
    }

    async fn submit(&self, task: ComputeTask) -> Result<TaskHandle, BackendError> {
        {
            let lifecycle = self.lifecycle.lock().await;
            if lifecycle.stopped {
                return Err(BackendError::Stopped);
            }
            if !lifecycle.started {
                return Err(BackendError::NotStarted);
            }
        }
        let (reporter, handle) = TaskHandle::channel(task.task_id.clone());
        self.shared
            .queue
            .lock()
            .await
            .push(PendingTask::new(task, reporter));
        self.shared.notify.notify_one();
        Ok(handle)
    }

    async fn stop(&self) -> Result<(), BackendError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return Ok(());
        }
        lifecycle.stopped = true;
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
        for pending in self.shared.queue.lock().await.drain() {
            pending.finish(prop_types::TaskOutcome::Errored(
                "backend stopped before the task ran".to_string(),
            ));
        }
        for slot in self.shared.slots.write().await.iter_mut() {
            *slot = SlotState::Dead;
        }
        info!("local pool stopped");
        Ok(())
    }

    async fn status(&self) -> BackendStatus {
        let mut slots = SlotCounts::default();
        for state in self.shared.slots.read().await.iter() {
            slots.record(*state);
        }
        BackendStatus {
            kind: "local".to_string(),
            running_tasks: slots.busy,
            slots,
            queued_tasks: self.shared.queue.lock().await.len(),
            completed_tasks: self.shared.completed.load(Ordering::Relaxed),
            fatal: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockEstimator;
    use prop_types::{EstimationSchema, Priority, PropertyType, TaskOutcome, WorkItem};
    use serde_json::json;

    fn task(id: &str, parameters: serde_json::Value) -> ComputeTask {
        ComputeTask {
            task_id: id.to_string(),
            cache_key: id.to_string(),
            work_item: WorkItem {
                id: id.to_string(),
                property_type: PropertyType::Density,
                parameters,
                replicate: 1,
                force_field: "ff".to_string(),
                force_field_hash: "hash".to_string(),
            },
            schema: EstimationSchema::default(),
            working_directory: std::env::temp_dir(),
            priority: Priority::Normal,
        }
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let pool = LocalPool::new(LocalPoolConfig::default(), Arc::new(MockEstimator::new()));
        let err = pool.submit(task("a", json!({}))).await.unwrap_err();
        assert!(matches!(err, BackendError::NotStarted));
    }

    #[tokio::test]
    async fn runs_tasks_and_reports_outcomes() {
        let estimator = Arc::new(MockEstimator::new());
        let pool = LocalPool::new(
            LocalPoolConfig {
                number_of_workers: 2,
                ..Default::default()
            },
            estimator.clone(),
        );
        pool.start().await.unwrap();

        let ok = pool.submit(task("ok", json!({"value": 0.8}))).await.unwrap();
        let bad = pool
            .submit(task("bad", json!({"outcome": "fail"})))
            .await
            .unwrap();
        match ok.outcome().await {
            TaskOutcome::Succeeded(e) => assert_eq!(e.value, 0.8),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(bad.outcome().await, TaskOutcome::Failed(_)));
        assert_eq!(estimator.calls(), 2);

        let status = pool.status().await;
        assert_eq!(status.completed_tasks, 2);
        assert_eq!(status.slots.idle, 2);
        pool.stop().await.unwrap();
        assert_eq!(pool.status().await.slots.dead, 2);
    }

    #[tokio::test]
    async fn never_exceeds_worker_count() {
        let estimator = Arc::new(MockEstimator::new().with_delay(Duration::from_millis(20)));
        let pool = LocalPool::new(
            LocalPoolConfig {
                number_of_workers: 3,
                ..Default::default()
            },
            estimator.clone(),
        );
        pool.start().await.unwrap();
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(pool.submit(task(&format!("t{i}"), json!({}))).await.unwrap());
        }
        for handle in handles {
            assert!(matches!(handle.outcome().await, TaskOutcome::Succeeded(_)));
        }
        assert!(estimator.max_in_flight() <= 3);
        assert_eq!(estimator.calls(), 10);
    }

    #[tokio::test]
    async fn task_over_ceiling_fails() {
        let pool = LocalPool::new(
            LocalPoolConfig {
                number_of_workers: 1,
                task_timeout_secs: Some(1),
                ..Default::default()
            },
            Arc::new(MockEstimator::new().with_delay(Duration::from_secs(30))),
        );
        pool.start().await.unwrap();
        let handle = pool.submit(task("slow", json!({}))).await.unwrap();
        match handle.outcome().await {
            TaskOutcome::Failed(reason) => assert!(reason.contains("wall-clock")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_resolves_queued_tasks() {
        let estimator = Arc::new(MockEstimator::gated());
        let pool = LocalPool::new(LocalPoolConfig::default(), estimator.clone());
        pool.start().await.unwrap();
        let first = pool.submit(task("first", json!({}))).await.unwrap();
        let second = pool.submit(task("second", json!({}))).await.unwrap();
        pool.stop().await.unwrap();
        assert!(matches!(first.outcome().await, TaskOutcome::Errored(_)));
        assert!(matches!(second.outcome().await, TaskOutcome::Errored(_)));
        assert!(matches!(
            pool.submit(task("late", json!({}))).await,
            Err(BackendError::Stopped)
        ));
    }
}
