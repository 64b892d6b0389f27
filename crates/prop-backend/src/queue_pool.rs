//! Elastic pool of worker slots backed by HPC queue allocations.
//!
//! An adaptive loop polls allocation states, scales the number of slots between
//! `min_workers` and `max_workers` according to queued plus running work, and dispatches queued
//! tasks onto idle slots. A slot lost mid-task gives its task back to the queue once; a second
//! loss fails the task. Too many consecutive provisioning failures put the pool into a fatal
//! state in which every outstanding and future task resolves to `BackendFatal`.

use crate::execute;
use crate::queue::{AllocationSpec, AllocationState, QueueSystem};
use crate::task_queue::{PendingTask, TaskQueue};
use crate::QueueWorkerResources;
use async_trait::async_trait;
use prop_types::{
    BackendError, BackendStatus, CalculationBackend, ComputeTask, Estimator, SlotContext,
    SlotCounts, SlotState, TaskHandle, TaskOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePoolConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub resources_per_worker: QueueWorkerResources,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default = "default_job_name")]
    pub job_name: String,
    #[serde(default = "default_adaptive_interval_ms")]
    pub adaptive_interval_ms: u64,
    /// Consecutive provisioning failures tolerated before the pool gives up.
    #[serde(default = "default_max_provision_attempts")]
    pub max_provision_attempts: u32,
    #[serde(default)]
    pub setup_script_commands: Vec<String>,
    #[serde(default)]
    pub extra_script_options: Vec<String>,
    /// `start` fails if `min_workers` are not granted within this many seconds.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    /// Per-task wall-clock ceiling in seconds.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    1
}

fn default_job_name() -> String {
    "prop-worker".to_string()
}

fn default_adaptive_interval_ms() -> u64 {
    1000
}

fn default_max_provision_attempts() -> u32 {
    3
}

impl Default for QueuePoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            resources_per_worker: QueueWorkerResources::default(),
            queue_name: None,
            job_name: default_job_name(),
            adaptive_interval_ms: default_adaptive_interval_ms(),
            max_provision_attempts: default_max_provision_attempts(),
            setup_script_commands: Vec::new(),
            extra_script_options: Vec::new(),
            startup_timeout_secs: None,
            task_timeout_secs: None,
        }
    }
}

impl QueuePoolConfig {
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.max_workers == 0 {
            return Err(BackendError::Other("max_workers must be at least 1".to_string()));
        }
        if self.min_workers > self.max_workers {
            return Err(BackendError::Other(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_provision_attempts == 0 {
            return Err(BackendError::Other(
                "max_provision_attempts must be at least 1".to_string(),
            ));
        }
        self.resources_per_worker
            .wallclock()
            .map_err(|e| BackendError::Other(e.to_string()))?;
        Ok(())
    }

    pub fn adaptive_interval(&self) -> Duration {
        Duration::from_millis(self.adaptive_interval_ms.max(1))
    }

    fn allocation_spec(&self, slot_id: u64) -> AllocationSpec {
        AllocationSpec {
            job_name: format!("{}-{}", self.job_name, slot_id),
            queue_name: self.queue_name.clone(),
            resources: self.resources_per_worker.clone(),
            setup_script_commands: self.setup_script_commands.clone(),
            extra_script_options: self.extra_script_options.clone(),
        }
    }
}

struct Running {
    pending: PendingTask,
    execution: JoinHandle<()>,
}

struct Slot {
    state: SlotState,
    allocation_id: Option<String>,
    current: Option<Running>,
}

#[derive(Default)]
struct PoolState {
    queue: TaskQueue,
    slots: BTreeMap<u64, Slot>,
    next_slot: u64,
    started: bool,
    accepting: bool,
    /// Set by `stop` before it waits for the adaptive loop to go quiet.
    stopping: bool,
    stopped: bool,
    fatal: Option<String>,
    provision_failures: u32,
    dead_slots: usize,
    completed: u64,
}

impl PoolState {
    fn count(&self, state: SlotState) -> usize {
        self.slots.values().filter(|s| s.state == state).count()
    }

    fn active(&self) -> usize {
        self.slots.values().filter(|s| s.state.is_active()).count()
    }

    fn retire(&mut self, slot_id: u64) -> Option<Slot> {
        let slot = self.slots.remove(&slot_id)?;
        self.dead_slots += 1;
        Some(slot)
    }

    /// Put a task that lost its slot back on the queue, or fail it if it already lost one.
    fn recover(&mut self, running: Running, reason: &str) {
        running.execution.abort();
        let pending = running.pending;
        if let Some(fatal) = &self.fatal {
            pending.finish(TaskOutcome::BackendFatal(fatal.clone()));
            self.completed += 1;
        } else if pending.requeued {
            warn!(task_id = %pending.task.task_id, reason, "task lost its worker twice, failing it");
            pending.finish(TaskOutcome::Failed(format!(
                "worker lost twice, last: {reason}"
            )));
            self.completed += 1;
        } else {
            info!(task_id = %pending.task.task_id, reason, "worker lost, re-queueing task");
            self.queue.requeue(pending);
        }
    }

    fn enter_fatal(&mut self, message: String) {
        if self.fatal.is_some() {
            return;
        }
        error!(error = %message, "queue pool can no longer provision workers");
        for pending in self.queue.drain() {
            pending.finish(TaskOutcome::BackendFatal(message.clone()));
            self.completed += 1;
        }
        self.fatal = Some(message);
    }

    fn provision_failed(&mut self, max_attempts: u32, reason: String) {
        self.provision_failures += 1;
        warn!(
            attempt = self.provision_failures,
            max_attempts,
            reason = %reason,
            "worker provisioning failed"
        );
        if self.provision_failures >= max_attempts {
            self.enter_fatal(format!(
                "{} consecutive provisioning failures, last: {}",
                self.provision_failures, reason
            ));
        }
    }
}

struct Core {
    config: QueuePoolConfig,
    queue_system: Arc<dyn QueueSystem>,
    estimator: Arc<dyn Estimator>,
    state: Mutex<PoolState>,
    wake: Notify,
    tick_lock: Mutex<()>,
}

impl Core {
    /// One adaptive pass: observe allocations, scale, dispatch.
    async fn tick(self: &Arc<Self>) {
        let _guard = self.tick_lock.lock().await;
        self.poll_allocations().await;
        self.scale().await;
        self.dispatch().await;
    }

    async fn poll_allocations(&self) {
        let watched: Vec<(u64, String)> = {
            let state = self.state.lock().await;
            state
                .slots
                .iter()
                .filter(|(_, slot)| slot.state != SlotState::Pending)
                .filter_map(|(id, slot)| slot.allocation_id.clone().map(|a| (*id, a)))
                .collect()
        };
        let mut observed = Vec::with_capacity(watched.len());
        for (slot_id, allocation_id) in watched {
            match self.queue_system.state(&allocation_id).await {
                Ok(allocation) => observed.push((slot_id, allocation)),
                Err(e) => {
                    warn!(slot_id, allocation_id = %allocation_id, error = %e, "could not poll allocation")
                }
            }
        }
        let mut state = self.state.lock().await;
        for (slot_id, allocation) in observed {
            self.apply(&mut state, slot_id, allocation);
        }
    }

    fn apply(&self, state: &mut PoolState, slot_id: u64, allocation: AllocationState) {
        let Some(slot) = state.slots.get_mut(&slot_id) else {
            return;
        };
        if allocation.is_live() {
            if slot.state == SlotState::Provisioning && allocation == AllocationState::Running {
                slot.state = SlotState::Idle;
                info!(slot_id, "worker slot granted");
                state.provision_failures = 0;
            }
            return;
        }
        let was_provisioning = slot.state == SlotState::Provisioning;
        let reason = format!("allocation ended: {allocation:?}");
        let Some(slot) = state.retire(slot_id) else {
            return;
        };
        if was_provisioning {
            state.provision_failed(self.config.max_provision_attempts, reason);
            return;
        }
        warn!(slot_id, reason = %reason, "worker slot lost");
        if let Some(running) = slot.current {
            state.recover(running, &reason);
        }
    }

    async fn scale(&self) {
        let (to_provision, to_release) = {
            let mut state = self.state.lock().await;
            if state.stopped || state.stopping || state.fatal.is_some() || !state.started {
                return;
            }
            let demand = state.queue.len() + state.count(SlotState::Busy);
            let desired = demand.clamp(self.config.min_workers, self.config.max_workers);
            let active = state.active();
            let mut to_provision = Vec::new();
            let mut to_release = Vec::new();
            if active < desired {
                for _ in active..desired {
                    let slot_id = state.next_slot;
                    state.next_slot += 1;
                    state.slots.insert(
                        slot_id,
                        Slot {
                            state: SlotState::Pending,
                            allocation_id: None,
                            current: None,
                        },
                    );
                    to_provision.push(slot_id);
                }
                debug!(active, desired, "scaling up");
            } else if active > desired {
                let mut excess = active - desired;
                for wanted in [SlotState::Provisioning, SlotState::Idle] {
                    for (slot_id, slot) in state.slots.iter_mut() {
                        if excess == 0 {
                            break;
                        }
                        if slot.state == wanted {
                            slot.state = SlotState::Draining;
                            to_release.push((*slot_id, slot.allocation_id.clone()));
                            excess -= 1;
                        }
                    }
                }
                if !to_release.is_empty() {
                    debug!(active, desired, releasing = to_release.len(), "scaling down");
                }
            }
            (to_provision, to_release)
        };

        for slot_id in to_provision {
            let spec = self.config.allocation_spec(slot_id);
            let submitted = self.queue_system.submit(&spec).await;
            let mut state = self.state.lock().await;
            match submitted {
                Ok(allocation_id) => match state.slots.get_mut(&slot_id) {
                    Some(slot) => {
                        info!(slot_id, allocation_id = %allocation_id, queue = self.queue_system.name(), "requested worker allocation");
                        slot.allocation_id = Some(allocation_id);
                        slot.state = SlotState::Provisioning;
                    }
                    None => {
                        // stopped while the request was in flight
                        drop(state);
                        self.release(&allocation_id).await;
                    }
                },
                Err(e) => {
                    if state.retire(slot_id).is_some() {
                        state.provision_failed(self.config.max_provision_attempts, e.to_string());
                    }
                }
            }
        }

        for (slot_id, allocation_id) in to_release {
            if let Some(allocation_id) = allocation_id {
                self.release(&allocation_id).await;
            }
            let mut state = self.state.lock().await;
            if state.slots.get(&slot_id).map(|s| s.state) == Some(SlotState::Draining) {
                state.retire(slot_id);
                info!(slot_id, "released idle worker slot");
            }
        }
    }

    async fn dispatch(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.stopped || state.stopping {
            return;
        }
        loop {
            let idle = state
                .slots
                .iter()
                .find(|(_, slot)| slot.state.is_ready())
                .map(|(id, _)| *id);
            let Some(slot_id) = idle else {
                break;
            };
            let Some(pending) = state.queue.pop() else {
                break;
            };
            self.launch(&mut state, slot_id, pending);
        }
    }

    fn launch(self: &Arc<Self>, state: &mut PoolState, slot_id: u64, pending: PendingTask) {
        let Some(slot) = state.slots.get_mut(&slot_id) else {
            state.queue.push(pending);
            return;
        };
        let context = SlotContext {
            slot_id: format!("{}-{}", self.config.job_name, slot_id),
            allocation_id: slot.allocation_id.clone(),
            resources: self.config.resources_per_worker.compute_resources(),
        };
        debug!(slot = %context.slot_id, task_id = %pending.task.task_id, "dispatching task");
        pending.reporter.running();
        let core = Arc::clone(self);
        let task = pending.task.clone();
        let ceiling = self.config.task_timeout_secs.map(Duration::from_secs);
        let execution = tokio::spawn(async move {
            let outcome = execute(core.estimator.as_ref(), &task, &context, ceiling).await;
            core.complete(slot_id, &task.task_id, outcome).await;
        });
        slot.state = SlotState::Busy;
        slot.current = Some(Running { pending, execution });
    }

    async fn complete(&self, slot_id: u64, task_id: &str, outcome: TaskOutcome) {
        let mut state = self.state.lock().await;
        let Some(slot) = state.slots.get_mut(&slot_id) else {
            return;
        };
        let owns_task = slot
            .current
            .as_ref()
            .is_some_and(|running| running.pending.task.task_id == task_id);
        if !owns_task {
            return;
        }
        let Some(running) = slot.current.take() else {
            return;
        };
        slot.state = SlotState::Idle;
        state.completed += 1;
        running.pending.finish(outcome);
        drop(state);
        self.wake.notify_one();
    }

    async fn release(&self, allocation_id: &str) {
        if let Err(e) = self.queue_system.cancel(allocation_id).await {
            warn!(allocation_id, error = %e, "failed to release allocation");
        }
    }

    /// Stop provisioning, let an in-flight tick record what the queue granted, then shut down.
    async fn wind_down(&self, adaptive: Option<JoinHandle<()>>, reason: &str) {
        {
            let mut state = self.state.lock().await;
            if state.stopped {
                return;
            }
            state.stopping = true;
            state.accepting = false;
        }
        self.wake.notify_one();
        let _guard = self.tick_lock.lock().await;
        if let Some(handle) = adaptive {
            handle.abort();
        }
        if self.state.lock().await.stopped {
            return;
        }
        self.shut_down(reason).await;
    }

    /// Resolve every task and release every allocation.
    async fn shut_down(&self, reason: &str) {
        let allocations: Vec<String> = {
            let mut state = self.state.lock().await;
            state.stopped = true;
            state.accepting = false;
            for pending in state.queue.drain() {
                pending.finish(TaskOutcome::Errored(format!("{reason} before the task ran")));
            }
            let ids: Vec<u64> = state.slots.keys().copied().collect();
            let mut allocations = Vec::new();
            for slot_id in ids {
                let Some(slot) = state.retire(slot_id) else {
                    continue;
                };
                if let Some(running) = slot.current {
                    running.execution.abort();
                    running
                        .pending
                        .finish(TaskOutcome::Errored(format!("{reason} while the task was running")));
                }
                allocations.extend(slot.allocation_id);
            }
            allocations
        };
        for allocation_id in &allocations {
            self.release(allocation_id).await;
        }
        info!(released = allocations.len(), "queue pool shut down");
    }
}

/// Elastic CalculationBackend over a QueueSystem.
pub struct QueuePool {
    core: Arc<Core>,
    adaptive: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl QueuePool {
    pub fn new(
        config: QueuePoolConfig,
        queue_system: Arc<dyn QueueSystem>,
        estimator: Arc<dyn Estimator>,
    ) -> Result<Self, BackendError> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(Core {
                config,
                queue_system,
                estimator,
                state: Mutex::new(PoolState::default()),
                wake: Notify::new(),
                tick_lock: Mutex::new(()),
            }),
            adaptive: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &QueuePoolConfig {
        &self.core.config
    }

    fn spawn_adaptive_loop(&self) {
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(core.config.adaptive_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = core.wake.notified() => {}
                }
                {
                    let state = core.state.lock().await;
                    if state.stopped || state.stopping {
                        break;
                    }
                }
                core.tick().await;
            }
        });
        if let Ok(mut slot) = self.adaptive.lock() {
            *slot = Some(handle);
        }
    }

    fn take_adaptive_loop(&self) -> Option<JoinHandle<()>> {
        self.adaptive.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl Drop for QueuePool {
    /// Release allocations in the background when the pool is dropped without `stop`.
    fn drop(&mut self) {
        let adaptive = self.take_adaptive_loop();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if let Some(handle) = adaptive {
                handle.abort();
            }
            return;
        };
        let core = Arc::clone(&self.core);
        runtime.spawn(async move {
            core.wind_down(adaptive, "backend dropped").await;
        });
    }
}

#[async_trait]
impl CalculationBackend for QueuePool {
    /// Provision `min_workers` slots and wait until they are granted.
    async fn start(&self) -> Result<(), BackendError> {
        {
            let mut state = self.core.state.lock().await;
            if state.stopped || state.stopping {
                return Err(BackendError::Stopped);
            }
            if state.started {
                return Ok(());
            }
            state.started = true;
        }
        let config = &self.core.config;
        info!(
            queue = self.core.queue_system.name(),
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            "starting queue pool"
        );
        let deadline = config
            .startup_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        loop {
            self.core.tick().await;
            {
                let mut state = self.core.state.lock().await;
                if state.stopped || state.stopping {
                    return Err(BackendError::Stopped);
                }
                if let Some(fatal) = state.fatal.clone() {
                    drop(state);
                    self.core.shut_down("backend failed to start").await;
                    return Err(BackendError::Provisioning(fatal));
                }
                if state.count(SlotState::Idle) >= config.min_workers {
                    state.accepting = true;
                    break;
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.core.shut_down("backend failed to start").await;
                return Err(BackendError::Provisioning(format!(
                    "{} workers not granted within {}s",
                    config.min_workers,
                    config.startup_timeout_secs.unwrap_or_default()
                )));
            }
            tokio::time::sleep(config.adaptive_interval()).await;
        }
        self.spawn_adaptive_loop();
        info!("queue pool ready");
        Ok(())
    }

    async fn submit(&self, task: ComputeTask) -> Result<TaskHandle, BackendError> {
        let (reporter, handle) = TaskHandle::channel(task.task_id.clone());
        {
            let mut state = self.core.state.lock().await;
            if state.stopped || state.stopping {
                return Err(BackendError::Stopped);
            }
            if !state.accepting {
                return Err(BackendError::NotStarted);
            }
            if let Some(fatal) = &state.fatal {
                reporter.finish(TaskOutcome::BackendFatal(fatal.clone()));
                return Ok(handle);
            }
            state.queue.push(PendingTask::new(task, reporter));
        }
        self.core.wake.notify_one();
        Ok(handle)
    }

    async fn stop(&self) -> Result<(), BackendError> {
        let adaptive = self.take_adaptive_loop();
        self.core.wind_down(adaptive, "backend stopped").await;
        Ok(())
    }

    async fn status(&self) -> BackendStatus {
        let state = self.core.state.lock().await;
        let mut slots = SlotCounts::default();
        for slot in state.slots.values() {
            slots.record(slot.state);
        }
        slots.dead += state.dead_slots;
        BackendStatus {
            kind: self.core.queue_system.name().to_string(),
            running_tasks: slots.busy,
            slots,
            queued_tasks: state.queue.len(),
            completed_tasks: state.completed,
            fatal: state.fatal.clone(),
        }
    }
}
