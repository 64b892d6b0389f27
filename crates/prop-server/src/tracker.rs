//! Per-request bookkeeping: work item states, outcomes, and the final result.

use prop_types::{
    CacheKey, Estimate, EstimatedProperty, EstimationException, ProgressCounts, Request,
    RequestResult, RequestStatus, RequestStatusData, UnsuccessfulProperty, WorkItemState,
};
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Terminal classification of one work item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ItemOutcome {
    Estimated {
        estimate: Estimate,
        cache_key: CacheKey,
        from_cache: bool,
    },
    Unsuccessful(String),
    Exception(String),
}

pub(crate) struct RequestRecord {
    pub request: Request,
    states: Vec<WorkItemState>,
    outcomes: Vec<Option<ItemOutcome>>,
    status: watch::Sender<RequestStatus>,
    /// Property id -> abort signal for that property chain.
    chains: HashMap<String, watch::Sender<bool>>,
    pub fault: Option<String>,
    pub result: Option<RequestResult>,
    pub completed_at: Option<String>,
    pub retrieved_at: Option<Instant>,
}

impl RequestRecord {
    pub fn new(request: Request) -> Self {
        let n = request.work_items.len();
        let chains = request
            .work_items
            .iter()
            .map(|item| (item.id.clone(), watch::channel(false).0))
            .collect();
        Self {
            request,
            states: vec![WorkItemState::Queued; n],
            outcomes: vec![None; n],
            status: watch::channel(RequestStatus::Pending).0,
            chains,
            fault: None,
            result: None,
            completed_at: None,
            retrieved_at: None,
        }
    }

    pub fn status(&self) -> RequestStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestStatus> {
        self.status.subscribe()
    }

    pub fn state(&self, index: usize) -> Option<WorkItemState> {
        self.states.get(index).copied()
    }

    /// Abort signal of the chain `index` belongs to.
    pub fn chain_signal(&self, index: usize) -> Option<watch::Receiver<bool>> {
        let item = self.request.work_items.get(index)?;
        self.chains.get(&item.id).map(|tx| tx.subscribe())
    }

    /// Move a work item forward. Returns false (and changes nothing) for a disallowed transition.
    pub fn transition(&mut self, index: usize, next: WorkItemState) -> bool {
        let Some(current) = self.states.get(index).copied() else {
            return false;
        };
        if !current.can_transition_to(next) {
            debug!(index, ?current, ?next, "ignoring transition");
            return false;
        }
        self.states[index] = next;
        if self.status() == RequestStatus::Pending {
            self.status.send_replace(RequestStatus::Running);
        }
        true
    }

    /// Move a work item to a terminal state and record its outcome. First terminal state wins.
    pub fn resolve(&mut self, index: usize, state: WorkItemState, outcome: ItemOutcome) -> bool {
        debug_assert!(state.is_terminal());
        if !self.transition(index, state) {
            return false;
        }
        self.outcomes[index] = Some(outcome);
        true
    }

    /// Fail every non-terminal item of a property chain and signal their tasks to stop.
    pub fn abort_chain(&mut self, property_id: &str, reason: &str) -> usize {
        let siblings: Vec<usize> = self
            .request
            .work_items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.id == property_id)
            .map(|(index, _)| index)
            .collect();
        let mut aborted = 0;
        for index in siblings {
            if self.resolve(
                index,
                WorkItemState::Failed,
                ItemOutcome::Unsuccessful(reason.to_string()),
            ) {
                aborted += 1;
            }
        }
        if let Some(signal) = self.chains.get(property_id) {
            signal.send_replace(true);
        }
        aborted
    }

    pub fn all_terminal(&self) -> bool {
        self.states.iter().all(|s| s.is_terminal())
    }

    /// Indices of items that have not reached a terminal state.
    pub fn unfinished(&self) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn progress(&self) -> ProgressCounts {
        let mut counts = ProgressCounts::default();
        for state in &self.states {
            match state {
                WorkItemState::Queued => counts.queued += 1,
                WorkItemState::Dispatched => counts.dispatched += 1,
                WorkItemState::Running => counts.running += 1,
                WorkItemState::Succeeded => counts.succeeded += 1,
                WorkItemState::Failed => counts.failed += 1,
                WorkItemState::Errored => counts.errored += 1,
            }
        }
        counts
    }

    /// Classify every resolved item, in work item order.
    pub fn build_result(&self) -> RequestResult {
        let mut result = RequestResult::new(self.request.id.clone());
        for (item, outcome) in self.request.work_items.iter().zip(&self.outcomes) {
            match outcome {
                Some(ItemOutcome::Estimated {
                    estimate,
                    cache_key,
                    from_cache,
                }) => result.estimated.push(EstimatedProperty {
                    id: item.id.clone(),
                    property_type: item.property_type,
                    replicate: item.replicate,
                    force_field: item.force_field.clone(),
                    value: estimate.value,
                    uncertainty: estimate.uncertainty,
                    cache_key: cache_key.to_string(),
                    from_cache: *from_cache,
                }),
                Some(ItemOutcome::Unsuccessful(reason)) => {
                    result.unsuccessful.push(UnsuccessfulProperty {
                        id: item.id.clone(),
                        property_type: item.property_type,
                        replicate: item.replicate,
                        force_field: item.force_field.clone(),
                        reason: reason.clone(),
                    })
                }
                Some(ItemOutcome::Exception(message)) => {
                    result.exceptions.push(EstimationException {
                        id: item.id.clone(),
                        property_type: item.property_type,
                        replicate: item.replicate,
                        force_field: item.force_field.clone(),
                        message: message.clone(),
                    })
                }
                None => {}
            }
        }
        result
    }

    /// Mark the request terminal and wake waiters.
    pub fn finish(&mut self, result: RequestResult) -> RequestStatus {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        let status = if self.fault.is_some() {
            RequestStatus::Faulted
        } else {
            self.result = Some(result);
            RequestStatus::Completed
        };
        self.status.send_replace(status);
        status
    }

    pub fn status_data(&self) -> RequestStatusData {
        RequestStatusData {
            request_id: self.request.id.clone(),
            status: self.status(),
            progress: self.progress(),
            submitted_at: self.request.submitted_at.clone(),
            completed_at: self.completed_at.clone(),
            result: self.result.clone(),
            error: self.fault.clone(),
        }
    }
}
