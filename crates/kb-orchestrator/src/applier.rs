use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::matcher::{match_task, waiting_for};
use crate::model::{AgentId, Board, TaskId};
use crate::store::{push_message, StatusChange};

/// Resolved result of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub succeeded: bool,
    /// Cleaned agent answer, or the error description.
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub status_change: Option<StatusChange>,
    /// Tasks the matcher handed to an agent while re-matching.
    pub assigned: Vec<TaskId>,
}

/// Records the message, moves the task to the agent's success/error status,
/// releases the agent and re-runs the matcher. Meant to run inside one
/// [`Store::transact`](crate::store::Store::transact).
///
/// The move only happens while the agent still holds the task in its working
/// status; a task moved by hand during the run keeps that status. A task that
/// did not move is not re-offered, otherwise an agent without a target status
/// would pick the same task up again forever.
pub fn apply(
    board: &mut Board,
    task_id: TaskId,
    agent_id: AgentId,
    transition: Transition,
) -> StoreResult<Applied> {
    let status_id = board
        .tasks
        .get(&task_id)
        .ok_or(StoreError::UnknownTask(task_id))?
        .status_id;
    let agent = board
        .agents
        .get(&agent_id)
        .ok_or(StoreError::UnknownAgent(agent_id))?;
    let holds = agent.current_task == Some(task_id) && agent.working_status == Some(status_id);
    let target = match (holds, transition.succeeded) {
        (false, _) => None,
        (true, true) => agent.success_status,
        (true, false) => agent.error_status,
    };
    let agent_name = agent.name.clone();
    if !holds {
        debug!(task_id, agent = %agent_name, "task changed hands during the run");
    }

    push_message(board, task_id, agent_id, transition.text)?;

    let task = board
        .tasks
        .get_mut(&task_id)
        .ok_or(StoreError::UnknownTask(task_id))?;
    let from = task.status_id;
    let status_change = match target {
        Some(to) if to != from => {
            task.status_id = to;
            Some(StatusChange {
                task_id,
                from: Some(from),
                to,
            })
        }
        _ => None,
    };

    if holds {
        if let Some(agent) = board.agents.get_mut(&agent_id) {
            agent.current_task = None;
        }
    }

    info!(
        task_id,
        agent = %agent_name,
        succeeded = transition.succeeded,
        moved_to = ?status_change.map(|change| change.to),
        "transition applied"
    );

    let mut assigned = Vec::new();
    if status_change.is_some() && match_task(board, task_id).is_some() {
        assigned.push(task_id);
    }
    for waiting in waiting_for(board, agent_id) {
        if waiting != task_id && match_task(board, waiting).is_some() {
            debug!(task_id = waiting, "picked up after release");
            assigned.push(waiting);
        }
    }

    Ok(Applied {
        status_change,
        assigned,
    })
}
