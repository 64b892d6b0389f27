//! Traits for calculation backends, result caches and estimators.

use crate::{Estimate, EstimationSchema, SlotCounts, WorkItem};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;

/// GPU platform a worker should prefer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuToolkit {
    #[default]
    Cuda,
    OpenCl,
}

/// Resources available to one worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeResources {
    #[serde(default = "default_threads")]
    pub number_of_threads: u32,
    #[serde(default)]
    pub number_of_gpus: u32,
    #[serde(default)]
    pub preferred_gpu_toolkit: Option<GpuToolkit>,
}

fn default_threads() -> u32 {
    1
}

impl Default for ComputeResources {
    fn default() -> Self {
        Self {
            number_of_threads: 1,
            number_of_gpus: 0,
            preferred_gpu_toolkit: None,
        }
    }
}

/// Scheduling class of a task. Higher classes are always dequeued first; FIFO within a class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

/// One unit of work handed to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeTask {
    pub task_id: String,
    pub cache_key: String,
    pub work_item: WorkItem,
    pub schema: EstimationSchema,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub priority: Priority,
}

/// Final outcome of a task as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Estimate),
    /// Ran but did not meet its acceptance criteria (or exceeded its wall-clock ceiling).
    Failed(String),
    /// Crashed: invalid input, resource exhaustion, estimator fault.
    Errored(String),
    /// The backend itself can no longer execute work.
    BackendFatal(String),
}

/// Progress of a task as seen through its handle.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPhase {
    Queued,
    Running,
    Finished(TaskOutcome),
}

/// Backend side of a task channel.
#[derive(Debug)]
pub struct TaskReporter {
    tx: watch::Sender<TaskPhase>,
}

impl TaskReporter {
    pub fn running(&self) {
        self.tx.send_replace(TaskPhase::Running);
    }

    pub fn finish(self, outcome: TaskOutcome) {
        self.tx.send_replace(TaskPhase::Finished(outcome));
    }

    /// Whether anyone is still waiting on the task.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Caller side of a task channel; resolves to the task outcome.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    rx: watch::Receiver<TaskPhase>,
}

impl TaskHandle {
    /// Create a connected reporter/handle pair for a new task.
    pub fn channel(task_id: impl Into<String>) -> (TaskReporter, TaskHandle) {
        let (tx, rx) = watch::channel(TaskPhase::Queued);
        (
            TaskReporter { tx },
            TaskHandle {
                task_id: task_id.into(),
                rx,
            },
        )
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn phase(&self) -> TaskPhase {
        self.rx.borrow().clone()
    }

    /// Wait for the next phase change. A reporter dropped without finishing yields an error outcome.
    pub async fn next_phase(&mut self) -> TaskPhase {
        if self.rx.changed().await.is_err() {
            return match self.phase() {
                finished @ TaskPhase::Finished(_) => finished,
                _ => TaskPhase::Finished(TaskOutcome::Errored(format!(
                    "task {} dropped by backend",
                    self.task_id
                ))),
            };
        }
        self.rx.borrow_and_update().clone()
    }

    /// Wait until the task finishes.
    pub async fn outcome(mut self) -> TaskOutcome {
        loop {
            if let TaskPhase::Finished(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }
            if let TaskPhase::Finished(outcome) = self.next_phase().await {
                return outcome;
            }
        }
    }
}

/// Where a task is executing; passed to the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotContext {
    pub slot_id: String,
    /// Queue allocation (e.g. a Slurm job id) backing the slot, if any.
    pub allocation_id: Option<String>,
    pub resources: ComputeResources,
}

/// Snapshot of a backend for status endpoints and logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub kind: String,
    pub slots: SlotCounts,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: u64,
    #[serde(default)]
    pub fatal: Option<String>,
}

/// Execution layer: maps tasks onto worker slots.
///
/// Contract: `start` must succeed before `submit`; `submit` never blocks on slot provisioning;
/// the returned handle always resolves, with `TaskOutcome::BackendFatal` once the backend has
/// hit an unrecoverable fault.
#[async_trait]
pub trait CalculationBackend: Send + Sync {
    async fn start(&self) -> Result<(), BackendError>;

    async fn submit(&self, task: ComputeTask) -> Result<TaskHandle, BackendError>;

    /// Drain queued work and release every slot.
    async fn stop(&self) -> Result<(), BackendError>;

    async fn status(&self) -> BackendStatus;
}

/// The scientific computation itself, executed on a worker slot.
#[async_trait]
pub trait Estimator: Send + Sync {
    async fn estimate(
        &self,
        task: &ComputeTask,
        slot: &SlotContext,
    ) -> Result<Estimate, EstimationError>;
}

/// Deterministic key over the inputs that determine a simulation result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored estimation artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Estimate,
    pub created_at: String,
    pub last_access: String,
    #[serde(default)]
    pub hits: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Estimate) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            payload,
            created_at: now.clone(),
            last_access: now,
            hits: 0,
        }
    }
}

/// Key-addressed store of estimation results.
///
/// Contract: an unreadable entry is reported as a miss (`Ok(None)`), never as an error.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend not started")]
    NotStarted,
    #[error("backend stopped")]
    Stopped,
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("backend error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EstimationError {
    #[error("estimate did not converge: {0}")]
    Unconverged(String),
    #[error("estimation crashed: {0}")]
    Crashed(String),
}

impl From<Result<Estimate, EstimationError>> for TaskOutcome {
    fn from(result: Result<Estimate, EstimationError>) -> Self {
        match result {
            Ok(estimate) => TaskOutcome::Succeeded(estimate),
            Err(EstimationError::Unconverged(reason)) => TaskOutcome::Failed(reason),
            Err(EstimationError::Crashed(message)) => TaskOutcome::Errored(message),
        }
    }
}
