//! Calculation backends: a fixed pool of local workers and an elastic pool of HPC queue
//! allocations, plus the estimators that run on their slots.

mod command;
mod config;
mod local;
mod queue;
mod queue_pool;
mod resources;
mod slurm;
mod task_queue;

#[cfg(feature = "test-util")]
mod mock;

pub use command::{CommandEstimator, CommandEstimatorConfig};
pub use config::{BackendConfig, SlurmPoolConfig};
pub use local::{LocalPool, LocalPoolConfig};
pub use queue::{AllocationSpec, AllocationState, QueueError, QueueSystem};
pub use queue_pool::{QueuePool, QueuePoolConfig};
pub use resources::{parse_wallclock, QueueWorkerResources};
pub use slurm::SlurmQueue;

#[cfg(feature = "test-util")]
pub use mock::{MockEstimator, MockQueue};

use prop_types::{ComputeTask, Estimator, SlotContext, TaskOutcome};
use std::time::Duration;

/// Run one task on a slot, turning a blown wall-clock ceiling into a failure.
pub(crate) async fn execute(
    estimator: &dyn Estimator,
    task: &ComputeTask,
    slot: &SlotContext,
    ceiling: Option<Duration>,
) -> TaskOutcome {
    let run = estimator.estimate(task, slot);
    match ceiling {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result.into(),
            Err(_) => TaskOutcome::Failed(format!(
                "exceeded wall-clock limit of {}s",
                limit.as_secs()
            )),
        },
        None => run.await.into(),
    }
}
