use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{StatusId, TaskId};

/// Notifications for an external sink such as a board UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    TaskStatusChanged {
        task_id: TaskId,
        status_id: StatusId,
    },
    TaskLlmStarted {
        task_id: TaskId,
    },
    TaskLlmFinished {
        task_id: TaskId,
        agent_name: Option<String>,
        working_status_id: Option<StatusId>,
        working_status_color: Option<String>,
    },
}

pub struct NotificationHub {
    sender: broadcast::Sender<Event>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        trace!(?event, "publish");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(256)
    }
}
