//! Lifecycle states for work items and worker slots.

use serde::{Deserialize, Serialize};

/// State of one work item inside the server.
///
/// `Queued -> Dispatched -> Running -> {Succeeded, Failed, Errored}`; any non-terminal state may
/// jump straight to a terminal one (cache hit, abort, invalid input). Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemState {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Errored,
}

impl WorkItemState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemState::Succeeded | WorkItemState::Failed | WorkItemState::Errored
        )
    }

    pub fn can_transition_to(self, next: WorkItemState) -> bool {
        use WorkItemState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Succeeded | Failed | Errored) => true,
            (Queued, Dispatched) | (Dispatched, Running) => true,
            _ => false,
        }
    }
}

/// State of one execution slot in a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Slot record created; allocation not yet requested.
    Pending,
    /// Allocation requested, waiting for the queue to grant it.
    Provisioning,
    Idle,
    Busy,
    /// Finishing its current task, will be released afterwards.
    Draining,
    Dead,
}

impl SlotState {
    /// Whether the slot holds (or is waiting for) an allocation.
    pub fn is_active(self) -> bool {
        !matches!(self, SlotState::Dead)
    }

    /// Whether the slot can take work right now.
    pub fn is_ready(self) -> bool {
        matches!(self, SlotState::Idle)
    }
}

/// Number of slots in each state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub pending: usize,
    pub provisioning: usize,
    pub idle: usize,
    pub busy: usize,
    pub draining: usize,
    pub dead: usize,
}

impl SlotCounts {
    pub fn record(&mut self, state: SlotState) {
        match state {
            SlotState::Pending => self.pending += 1,
            SlotState::Provisioning => self.provisioning += 1,
            SlotState::Idle => self.idle += 1,
            SlotState::Busy => self.busy += 1,
            SlotState::Draining => self.draining += 1,
            SlotState::Dead => self.dead += 1,
        }
    }

    pub fn active(&self) -> usize {
        self.pending + self.provisioning + self.idle + self.busy + self.draining
    }
}
