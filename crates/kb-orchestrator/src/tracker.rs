use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::events::{Event, NotificationHub};
use crate::model::{StatusId, TaskId};

/// What a finished run reports about the agent that worked it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub agent_name: Option<String>,
    pub working_status_id: Option<StatusId>,
    pub working_status_color: Option<String>,
}

#[derive(Debug, Default)]
struct Runs {
    running: BTreeSet<TaskId>,
    /// Triggers that arrived while the task was running.
    deferred: BTreeSet<TaskId>,
    /// Finished runs owed one more pass.
    ready: Vec<TaskId>,
}

/// Task ids with an orchestration run in flight.
///
/// A second trigger for a running task is not run concurrently; it is
/// coalesced into a single rerun that becomes available through
/// [`take_ready`](Self::take_ready) once the current run finishes.
pub struct ConcurrencyTracker {
    runs: Mutex<Runs>,
    hub: Arc<NotificationHub>,
}

impl ConcurrencyTracker {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self {
            runs: Mutex::new(Runs::default()),
            hub,
        }
    }

    fn runs(&self) -> MutexGuard<'_, Runs> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `task_id`; `false` if a run for it is already in flight, in which
    /// case the trigger is remembered for a rerun.
    pub fn start(&self, task_id: TaskId) -> bool {
        let mut runs = self.runs();
        if runs.running.insert(task_id) {
            debug!(task_id, "run started");
            true
        } else {
            runs.deferred.insert(task_id);
            false
        }
    }

    /// Publishes `task_llm_started` once the run has an agent.
    pub fn announce(&self, task_id: TaskId) {
        self.hub.publish(Event::TaskLlmStarted { task_id });
    }

    /// Releases `task_id`. `task_llm_finished` is published for announced runs.
    pub fn finish(&self, task_id: TaskId, summary: Option<RunSummary>) {
        {
            let mut runs = self.runs();
            if !runs.running.remove(&task_id) {
                return;
            }
            if runs.deferred.remove(&task_id) {
                runs.ready.push(task_id);
            }
        }

        let Some(summary) = summary else {
            debug!(task_id, "run finished without an agent");
            return;
        };
        debug!(task_id, agent = ?summary.agent_name, "run finished");
        self.hub.publish(Event::TaskLlmFinished {
            task_id,
            agent_name: summary.agent_name,
            working_status_id: summary.working_status_id,
            working_status_color: summary.working_status_color,
        });
    }

    /// Drains the tasks whose deferred trigger is now due.
    pub fn take_ready(&self) -> Vec<TaskId> {
        std::mem::take(&mut self.runs().ready)
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.runs().running.contains(&task_id)
    }

    pub fn running(&self) -> Vec<TaskId> {
        self.runs().running.iter().copied().collect()
    }
}

/// Releases the tracker entry when dropped, on every exit path of a run
/// including panics.
pub struct RunGuard {
    tracker: Arc<ConcurrencyTracker>,
    task_id: TaskId,
    summary: Option<RunSummary>,
}

impl RunGuard {
    pub fn new(tracker: Arc<ConcurrencyTracker>, task_id: TaskId) -> Self {
        Self {
            tracker,
            task_id,
            summary: None,
        }
    }

    /// Marks the run as working with an agent and announces it.
    pub fn record(&mut self, summary: RunSummary) {
        if self.summary.is_none() {
            self.tracker.announce(self.task_id);
        }
        self.summary = Some(summary);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.task_id, self.summary.take());
    }
}
