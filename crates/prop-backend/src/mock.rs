//! Test doubles: an in-memory batch queue and a scripted estimator.

use crate::queue::{AllocationSpec, AllocationState, QueueError, QueueSystem};
use async_trait::async_trait;
use prop_types::{ComputeTask, Estimate, EstimationError, Estimator, SlotContext};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Default)]
struct MockQueueState {
    next_id: u64,
    allocations: BTreeMap<String, AllocationState>,
    specs: Vec<AllocationSpec>,
    max_live: usize,
    rejections_remaining: u32,
    reject_all: bool,
    hold_pending: bool,
}

impl MockQueueState {
    fn live(&self) -> usize {
        self.allocations.values().filter(|s| s.is_live()).count()
    }
}

/// In-memory QueueSystem. Allocations are granted immediately unless held pending.
#[derive(Default)]
pub struct MockQueue {
    state: Mutex<MockQueueState>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockQueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject the next `n` allocation requests.
    pub fn reject_next(&self, n: u32) {
        self.lock().rejections_remaining = n;
    }

    pub fn reject_all(&self) {
        self.lock().reject_all = true;
    }

    /// Keep new allocations pending until `grant_all` is called.
    pub fn hold_pending(&self, hold: bool) {
        self.lock().hold_pending = hold;
    }

    pub fn grant_all(&self) {
        for state in self.lock().allocations.values_mut() {
            if *state == AllocationState::Pending {
                *state = AllocationState::Running;
            }
        }
    }

    /// Force an allocation into a state, e.g. to simulate preemption.
    pub fn set_state(&self, allocation_id: &str, state: AllocationState) {
        if let Some(current) = self.lock().allocations.get_mut(allocation_id) {
            *current = state;
        }
    }

    pub fn running_allocations(&self) -> Vec<String> {
        self.lock()
            .allocations
            .iter()
            .filter(|(_, s)| **s == AllocationState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Allocations currently pending or running.
    pub fn live(&self) -> usize {
        self.lock().live()
    }

    /// Highest number of simultaneously live allocations seen.
    pub fn max_live(&self) -> usize {
        self.lock().max_live
    }

    pub fn submitted(&self) -> usize {
        self.lock().specs.len()
    }

    pub fn specs(&self) -> Vec<AllocationSpec> {
        self.lock().specs.clone()
    }
}

#[async_trait]
impl QueueSystem for MockQueue {
    fn name(&self) -> &str {
        "mock"
    }

    async fn submit(&self, spec: &AllocationSpec) -> Result<String, QueueError> {
        let mut state = self.lock();
        if state.reject_all {
            return Err(QueueError::Rejected("queue refuses all jobs".to_string()));
        }
        if state.rejections_remaining > 0 {
            state.rejections_remaining -= 1;
            return Err(QueueError::Rejected("queue refused the job".to_string()));
        }
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        let initial = if state.hold_pending {
            AllocationState::Pending
        } else {
            AllocationState::Running
        };
        state.allocations.insert(id.clone(), initial);
        state.specs.push(spec.clone());
        state.max_live = state.max_live.max(state.live());
        Ok(id)
    }

    async fn state(&self, allocation_id: &str) -> Result<AllocationState, QueueError> {
        Ok(self
            .lock()
            .allocations
            .get(allocation_id)
            .cloned()
            .unwrap_or_else(|| AllocationState::Failed("unknown allocation".to_string())))
    }

    async fn cancel(&self, allocation_id: &str) -> Result<(), QueueError> {
        if let Some(state) = self.lock().allocations.get_mut(allocation_id) {
            if state.is_live() {
                *state = AllocationState::Completed;
            }
        }
        Ok(())
    }
}

/// Estimator driven by the work item parameters.
///
/// `{"value": x}` sets the estimate, `{"outcome": "fail"}` reports non-convergence,
/// `{"outcome": "crash"}` reports a crash. A gated estimator holds every call until
/// `open_gate` releases it.
#[derive(Default)]
pub struct MockEstimator {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    per_item: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    gate: Option<Semaphore>,
}

impl MockEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    /// Let `n` held calls complete.
    pub fn open_gate(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls made for a property id.
    pub fn calls_for(&self, property_id: &str) -> usize {
        self.per_item
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(property_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Estimator for MockEstimator {
    async fn estimate(
        &self,
        task: &ComputeTask,
        _slot: &SlotContext,
    ) -> Result<Estimate, EstimationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_item
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(task.work_item.id.clone())
            .or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(EstimationError::Crashed("gate closed".to_string())),
            }
        }

        let parameters = &task.work_item.parameters;
        match parameters.get("outcome").and_then(|v| v.as_str()) {
            Some("fail") => Err(EstimationError::Unconverged(
                "uncertainty target not reached".to_string(),
            )),
            Some("crash") => Err(EstimationError::Crashed("simulation blew up".to_string())),
            _ => Ok(Estimate {
                value: parameters
                    .get("value")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1.0),
                uncertainty: 0.01,
                iterations: 1,
            }),
        }
    }
}
