//! Batch queue abstraction: request, poll and release worker allocations.

use crate::QueueWorkerResources;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything a queue needs to start one worker allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSpec {
    pub job_name: String,
    #[serde(default)]
    pub queue_name: Option<String>,
    pub resources: QueueWorkerResources,
    /// Shell lines run before the worker starts (environment activation etc.).
    #[serde(default)]
    pub setup_script_commands: Vec<String>,
    /// Extra scheduler directives, e.g. `--partition=gpu`.
    #[serde(default)]
    pub extra_script_options: Vec<String>,
}

/// Queue-side state of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    Pending,
    Running,
    /// Left the queue normally.
    Completed,
    Preempted,
    /// Hit its wall-clock limit.
    TimedOut,
    Failed(String),
}

impl AllocationState {
    pub fn is_live(&self) -> bool {
        matches!(self, AllocationState::Pending | AllocationState::Running)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue refused the allocation request.
    #[error("allocation rejected: {0}")]
    Rejected(String),
    /// The queue could not be reached; the call may succeed later.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("invalid resources: {0}")]
    InvalidResources(String),
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An HPC batch queue (Slurm, or a mock in tests).
#[async_trait]
pub trait QueueSystem: Send + Sync {
    fn name(&self) -> &str;

    /// Request an allocation; returns the queue's id for it.
    async fn submit(&self, spec: &AllocationSpec) -> Result<String, QueueError>;

    async fn state(&self, allocation_id: &str) -> Result<AllocationState, QueueError>;

    /// Release an allocation. Releasing one that already left the queue is not an error.
    async fn cancel(&self, allocation_id: &str) -> Result<(), QueueError>;
}
