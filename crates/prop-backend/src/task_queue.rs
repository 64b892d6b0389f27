//! Priority FIFO of tasks waiting for a slot.

use prop_types::{ComputeTask, Priority, TaskOutcome, TaskReporter};
use std::collections::VecDeque;
use tracing::debug;

/// A submitted task together with the channel its caller is waiting on.
pub(crate) struct PendingTask {
    pub task: ComputeTask,
    pub reporter: TaskReporter,
    /// Set once the task has been put back after losing its slot.
    pub requeued: bool,
}

impl PendingTask {
    pub fn new(task: ComputeTask, reporter: TaskReporter) -> Self {
        Self {
            task,
            reporter,
            requeued: false,
        }
    }

    pub fn finish(self, outcome: TaskOutcome) {
        self.reporter.finish(outcome);
    }
}

/// FIFO per priority class; `High` always drains before `Normal`.
#[derive(Default)]
pub(crate) struct TaskQueue {
    high: VecDeque<PendingTask>,
    normal: VecDeque<PendingTask>,
}

impl TaskQueue {
    fn class(&mut self, priority: Priority) -> &mut VecDeque<PendingTask> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        }
    }

    pub fn push(&mut self, pending: PendingTask) {
        self.class(pending.task.priority).push_back(pending);
    }

    /// Put a task back at the head of its class.
    pub fn requeue(&mut self, mut pending: PendingTask) {
        pending.requeued = true;
        self.class(pending.task.priority).push_front(pending);
    }

    /// Next task whose caller is still waiting.
    pub fn pop(&mut self) -> Option<PendingTask> {
        while let Some(pending) = self.high.pop_front().or_else(|| self.normal.pop_front()) {
            if pending.reporter.is_abandoned() {
                debug!(task_id = %pending.task.task_id, "dropping abandoned task");
                continue;
            }
            return Some(pending);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&mut self) -> Vec<PendingTask> {
        self.high.drain(..).chain(self.normal.drain(..)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prop_types::{EstimationSchema, PropertyType, TaskHandle, WorkItem};

    fn task(id: &str, priority: Priority) -> (PendingTask, TaskHandle) {
        let (reporter, handle) = TaskHandle::channel(id);
        let task = ComputeTask {
            task_id: id.to_string(),
            cache_key: id.to_string(),
            work_item: WorkItem {
                id: id.to_string(),
                property_type: PropertyType::Density,
                parameters: serde_json::Value::Null,
                replicate: 1,
                force_field: "ff".to_string(),
                force_field_hash: "h".to_string(),
            },
            schema: EstimationSchema::default(),
            working_directory: std::path::PathBuf::from("wd"),
            priority,
        };
        (PendingTask::new(task, reporter), handle)
    }

    #[test]
    fn high_priority_first_then_fifo() {
        let mut queue = TaskQueue::default();
        let (a, _ha) = task("a", Priority::Normal);
        let (b, _hb) = task("b", Priority::Normal);
        let (c, _hc) = task("c", Priority::High);
        queue.push(a);
        queue.push(b);
        queue.push(c);
        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|p| p.task.task_id)
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn requeued_task_goes_to_front_of_its_class() {
        let mut queue = TaskQueue::default();
        let (a, _ha) = task("a", Priority::Normal);
        let (b, _hb) = task("b", Priority::Normal);
        queue.push(a);
        queue.requeue(b);
        let first = queue.pop().unwrap();
        assert_eq!(first.task.task_id, "b");
        assert!(first.requeued);
    }

    #[test]
    fn abandoned_tasks_are_skipped() {
        let mut queue = TaskQueue::default();
        let (a, ha) = task("a", Priority::Normal);
        let (b, _hb) = task("b", Priority::Normal);
        queue.push(a);
        queue.push(b);
        drop(ha);
        assert_eq!(queue.pop().unwrap().task.task_id, "b");
        assert!(queue.pop().is_none());
    }
}
