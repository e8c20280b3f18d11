use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, warn};

use crate::applier::{apply, Transition};
use crate::context::InstructionInputs;
use crate::error::{ExecutorError, StoreResult};
use crate::events::{Event, NotificationHub};
use crate::executor::{PromptExecutor, PromptRequest};
use crate::matcher::{match_task, waiting_for};
use crate::model::{Agent, AgentId, Board, RoleId, StatusId, Task, TaskId};
use crate::observer::StatusChangeObserver;
use crate::outcome::{interpret, Completion, MissingMarker};
use crate::store::{AgentSpec, Setting, StatusChange, Store, TaskSpec};
use crate::tracker::{ConcurrencyTracker, RunGuard, RunSummary};

pub const EMPTY_RESPONSE: &str = "Agent returned no result.";

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub workers: usize,
    pub missing_marker: MissingMarker,
    /// Used when an agent has no credential or model of its own.
    pub api_key: String,
    pub model: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            missing_marker: MissingMarker::Error,
            api_key: String::new(),
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Queued,
    /// A run for the task is in flight. Triggers arriving meanwhile coalesce
    /// into one rerun queued after it finishes.
    AlreadyRunning,
    /// The worker pool is gone.
    Closed,
}

struct Inner {
    store: Arc<Store>,
    executor: PromptExecutor,
    tracker: Arc<ConcurrencyTracker>,
    observer: StatusChangeObserver,
    hub: Arc<NotificationHub>,
    options: OrchestratorOptions,
    queue: mpsc::UnboundedSender<TaskId>,
    pending: AtomicUsize,
    idle: Notify,
}

/// Schedules orchestration runs onto a fixed pool of workers fed by a task-id
/// queue. At most one run per task is in flight; a trigger for a running task is
/// deferred until that run has finished, as is the run's own follow-up work.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Spawns the worker pool; must be called inside a Tokio runtime.
    pub fn start(
        store: Arc<Store>,
        executor: PromptExecutor,
        hub: Arc<NotificationHub>,
        options: OrchestratorOptions,
    ) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let workers = options.workers.max(1);

        let inner = Arc::new(Inner {
            store,
            executor,
            tracker: Arc::new(ConcurrencyTracker::new(Arc::clone(&hub))),
            observer: StatusChangeObserver::new(Arc::clone(&hub)),
            hub,
            options,
            queue,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        for worker in 0..workers {
            tokio::spawn(worker_loop(
                worker,
                Arc::downgrade(&inner),
                Arc::clone(&receiver),
            ));
        }
        info!(workers, "orchestrator started");

        Self { inner }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn tracker(&self) -> &Arc<ConcurrencyTracker> {
        &self.inner.tracker
    }

    pub fn executor(&self) -> &PromptExecutor {
        &self.inner.executor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.hub.subscribe()
    }

    pub fn schedule(&self, task_id: TaskId) -> ScheduleOutcome {
        if !self.inner.tracker.start(task_id) {
            info!(task_id, "run in flight, trigger deferred until it finishes");
            return ScheduleOutcome::AlreadyRunning;
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.inner.queue.send(task_id).is_err() {
            error!(task_id, "worker pool closed");
            self.inner.tracker.finish(task_id, None);
            self.inner.job_done();
            return ScheduleOutcome::Closed;
        }
        debug!(task_id, "run queued");
        ScheduleOutcome::Queued
    }

    /// Hands the status changes of a committed write to the observer and
    /// schedules the resulting runs.
    pub fn commit(&self, changes: &[StatusChange]) -> Vec<(TaskId, ScheduleOutcome)> {
        self.inner
            .observer
            .on_commit(changes)
            .into_iter()
            .map(|(task_id, _)| (task_id, self.schedule(task_id)))
            .collect()
    }

    pub fn create_task(&self, spec: TaskSpec) -> StoreResult<Task> {
        let (task, change) = self.inner.store.create_task(spec)?;
        self.commit(&[change]);
        Ok(task)
    }

    pub fn move_task(&self, task_id: TaskId, status_id: StatusId) -> StoreResult<Option<StatusChange>> {
        let change = self.inner.store.update_task_status(task_id, status_id)?;
        if let Some(change) = change {
            self.commit(&[change]);
        }
        Ok(change)
    }

    pub fn apply_status_updates(
        &self,
        updates: &[(TaskId, StatusId)],
    ) -> StoreResult<Vec<StatusChange>> {
        let changes = self.inner.store.apply_status_updates(updates)?;
        self.commit(&changes);
        Ok(changes)
    }

    /// Updates the agent, drops its compiled context and offers it the tasks
    /// waiting in its (possibly new) working status.
    pub fn update_agent(&self, agent_id: AgentId, spec: AgentSpec) -> StoreResult<Agent> {
        let agent = self.inner.store.update_agent(agent_id, spec)?;
        self.inner.executor.contexts().invalidate(agent_id);
        let waiting = self
            .inner
            .store
            .read(|board| waiting_for(board, agent_id))?;
        for task_id in waiting {
            self.schedule(task_id);
        }
        Ok(agent)
    }

    pub fn delete_agent(&self, agent_id: AgentId) -> StoreResult<Agent> {
        let agent = self.inner.store.delete_agent(agent_id)?;
        self.inner.executor.contexts().invalidate(agent_id);
        Ok(agent)
    }

    pub fn update_role_instruction(&self, role_id: RoleId, instruction: &str) -> StoreResult<()> {
        for agent_id in self
            .inner
            .store
            .update_role_instruction(role_id, instruction)?
        {
            self.inner.executor.contexts().invalidate(agent_id);
        }
        Ok(())
    }

    pub fn set_base_instructions(&self, text: &str) -> StoreResult<()> {
        self.inner
            .store
            .set_setting(Setting::BaseInstructions(text.to_string()))?;
        self.inner.executor.contexts().clear();
        Ok(())
    }

    /// Schedules every task sitting in some agent's working status.
    pub fn rescan(&self) -> StoreResult<Vec<TaskId>> {
        let candidates = self.inner.store.read(|board| {
            board
                .tasks
                .values()
                .filter(|task| {
                    board
                        .agents
                        .values()
                        .any(|agent| agent.working_status == Some(task.status_id))
                })
                .map(|task| task.id)
                .collect::<Vec<_>>()
        })?;

        Ok(candidates
            .into_iter()
            .filter(|&task_id| self.schedule(task_id) == ScheduleOutcome::Queued)
            .collect())
    }

    /// Resolves once no run is queued or in flight, cascades included.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn job_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn resolve(&self, task_id: TaskId, result: Result<String, ExecutorError>) -> Transition {
        match result {
            Ok(text) if text.trim().is_empty() => {
                warn!(task_id, "empty agent response");
                Transition {
                    succeeded: false,
                    text: EMPTY_RESPONSE.to_string(),
                }
            }
            Ok(text) => {
                let interpretation = interpret(&text);
                if interpretation.completion == Completion::Unknown {
                    warn!(
                        task_id,
                        policy = ?self.options.missing_marker,
                        "agent answer has no completion marker"
                    );
                }
                Transition {
                    succeeded: self.options.missing_marker.resolve(interpretation.completion),
                    text: interpretation.text,
                }
            }
            Err(err) => {
                warn!(task_id, "agent run failed: {}", err);
                Transition {
                    succeeded: false,
                    text: format!("Agent run failed: {err}"),
                }
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    inner: Weak<Inner>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<TaskId>>>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(task_id) = next else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        debug!(worker, task_id, "worker picked up run");
        let follow_ups = match tokio::spawn(run_task(Arc::clone(&inner), task_id)).await {
            Ok(follow_ups) => follow_ups,
            Err(err) => {
                error!(task_id, "run aborted: {}", err);
                Vec::new()
            }
        };

        let orchestrator = Orchestrator {
            inner: Arc::clone(&inner),
        };
        for follow_up in follow_ups {
            orchestrator.schedule(follow_up);
        }
        for rerun in inner.tracker.take_ready() {
            debug!(task_id = rerun, "running deferred trigger");
            orchestrator.schedule(rerun);
        }
        inner.job_done();
    }
    debug!(worker, "worker stopped");
}

/// What a run needs from the board once its agent is claimed.
struct Claim {
    agent: Agent,
    inputs: InstructionInputs,
    prompt: String,
    status_id: StatusId,
    status_color: String,
}

fn claim_agent(board: &mut Board, task_id: TaskId) -> Option<Claim> {
    let agent_id = match_task(board, task_id)?;
    let agent = board.agents.get(&agent_id)?.clone();
    let task = board.tasks.get(&task_id)?;
    let inputs = InstructionInputs::for_agent(board, agent_id)?;
    let status_color = board
        .statuses
        .get(&task.status_id)
        .map(|status| status.color.clone())
        .unwrap_or_default();

    Some(Claim {
        prompt: build_prompt(board, task),
        status_id: task.status_id,
        status_color,
        agent,
        inputs,
    })
}

/// Title followed by the message log, oldest first.
pub fn build_prompt(board: &Board, task: &Task) -> String {
    let mut prompt = task.title.trim().to_string();
    for message in board.messages_for(task.id) {
        prompt.push_str("\n\n");
        prompt.push_str(&board.agent_name(message.author_id));
        prompt.push_str(": ");
        prompt.push_str(message.text.trim());
    }
    prompt
}

/// One orchestration run. Returns the tasks that need a run afterwards.
async fn run_task(inner: Arc<Inner>, task_id: TaskId) -> Vec<TaskId> {
    let mut guard = RunGuard::new(Arc::clone(&inner.tracker), task_id);

    // The claim commits before the remote call so no other run can take the agent.
    let claim = match inner.store.transact(|board| Ok(claim_agent(board, task_id))) {
        Ok(Some(claim)) => claim,
        Ok(None) => {
            debug!(task_id, "no agent for task");
            return Vec::new();
        }
        Err(err) => {
            error!(task_id, "claim failed: {}", err);
            return Vec::new();
        }
    };

    let agent = &claim.agent;
    guard.record(RunSummary {
        agent_name: Some(agent.name.clone()),
        working_status_id: agent.working_status,
        working_status_color: Some(claim.status_color.clone()),
    });
    info!(task_id, agent = %agent.name, "running agent");

    let api_key = agent
        .api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| inner.options.api_key.clone());
    let model = agent
        .model
        .clone()
        .filter(|model| !model.trim().is_empty())
        .unwrap_or_else(|| inner.options.model.clone());

    let result = inner
        .executor
        .run(PromptRequest {
            agent_id: agent.id,
            inputs: &claim.inputs,
            api_key: &api_key,
            model: &model,
            prompt: &claim.prompt,
            task_id: Some(task_id),
            status_id: Some(claim.status_id),
        })
        .await;

    let transition = inner.resolve(task_id, result);
    let agent_id = agent.id;
    let applied = match inner
        .store
        .transact(|board| apply(board, task_id, agent_id, transition))
    {
        Ok(applied) => applied,
        Err(err) => {
            warn!(task_id, "transition not applied: {}", err);
            return Vec::new();
        }
    };

    let changes: Vec<StatusChange> = applied.status_change.into_iter().collect();
    let mut follow_ups: Vec<TaskId> = inner
        .observer
        .on_commit(&changes)
        .into_iter()
        .map(|(task_id, _)| task_id)
        .collect();
    for assigned in applied.assigned {
        if !follow_ups.contains(&assigned) {
            follow_ups.push(assigned);
        }
    }
    follow_ups
}
