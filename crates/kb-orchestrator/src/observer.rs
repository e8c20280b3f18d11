use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::events::{Event, NotificationHub};
use crate::model::{StatusId, TaskId};
use crate::store::StatusChange;

/// Turns the status changes of one commit into notifications and the set of
/// tasks that need an orchestration run.
pub struct StatusChangeObserver {
    hub: Arc<NotificationHub>,
}

impl StatusChangeObserver {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }

    /// Several changes to one task collapse to its final status. Returns the
    /// tasks to run, by ascending id.
    pub fn on_commit(&self, changes: &[StatusChange]) -> Vec<(TaskId, StatusId)> {
        let mut latest: BTreeMap<TaskId, StatusId> = BTreeMap::new();
        for change in changes {
            latest.insert(change.task_id, change.to);
        }

        for (&task_id, &status_id) in &latest {
            debug!(task_id, status_id, "task status changed");
            self.hub
                .publish(Event::TaskStatusChanged { task_id, status_id });
        }
        latest.into_iter().collect()
    }
}
