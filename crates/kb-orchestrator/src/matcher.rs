use tracing::debug;

use crate::model::{AgentId, Board, TaskId};

/// Decides which agent holds `task_id`, mutating at most `current_task` fields.
///
/// An existing holder whose working status still equals the task's status is
/// kept. A stale holder is released and the task is offered to idle agents
/// watching its status, first by name. Calling this again on an unchanged board
/// is a no-op.
pub fn match_task(board: &mut Board, task_id: TaskId) -> Option<AgentId> {
    let status_id = board.tasks.get(&task_id)?.status_id;

    if let Some(holder) = release_stale(board, task_id) {
        return Some(holder);
    }

    let candidate = board
        .agents
        .values()
        .filter(|agent| agent.working_status == Some(status_id) && agent.is_idle())
        .min_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)))
        .map(|agent| agent.id)?;

    let agent = board.agents.get_mut(&candidate)?;
    agent.current_task = Some(task_id);
    debug!(task_id, agent = %agent.name, "task assigned");
    Some(candidate)
}

/// Clears the holder of `task_id` when its working status no longer matches
/// the task's status. Returns the holder that is still valid, if any.
pub fn release_stale(board: &mut Board, task_id: TaskId) -> Option<AgentId> {
    let status_id = board.tasks.get(&task_id)?.status_id;
    let holder = board
        .agents
        .values_mut()
        .find(|agent| agent.current_task == Some(task_id))?;
    if holder.working_status == Some(status_id) {
        return Some(holder.id);
    }
    debug!(task_id, agent = %holder.name, "releasing stale assignment");
    holder.current_task = None;
    None
}

/// Unassigned tasks sitting in `agent_id`'s working status, by ascending id.
pub fn waiting_for(board: &Board, agent_id: AgentId) -> Vec<TaskId> {
    let Some(status_id) = board
        .agents
        .get(&agent_id)
        .and_then(|agent| agent.working_status)
    else {
        return Vec::new();
    };

    board
        .tasks
        .values()
        .filter(|task| task.status_id == status_id && board.holder_of(task.id).is_none())
        .map(|task| task.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, Status, Task};

    fn agent(id: AgentId, name: &str, working: u64) -> Agent {
        Agent {
            id,
            name: name.into(),
            role_id: None,
            project_id: 1,
            working_status: Some(working),
            success_status: None,
            error_status: None,
            current_task: None,
            acceptance_criteria: String::new(),
            transfer_criteria: String::new(),
            api_key: None,
            model: None,
        }
    }

    fn board() -> Board {
        let mut board = Board::default();
        for (id, name) in [(10, "Working"), (11, "Review")] {
            board.statuses.insert(
                id,
                Status {
                    id,
                    name: name.into(),
                    color: String::new(),
                    project_id: 1,
                },
            );
        }
        board.agents.insert(2, agent(2, "zed", 10));
        board.agents.insert(3, agent(3, "amy", 10));
        board.agents.insert(4, agent(4, "rev", 11));
        for id in [100, 101] {
            board.tasks.insert(
                id,
                Task {
                    id,
                    title: format!("task {id}"),
                    project_id: 1,
                    status_id: 10,
                },
            );
        }
        board
    }

    fn holders(board: &Board, task_id: TaskId) -> usize {
        board
            .agents
            .values()
            .filter(|agent| agent.current_task == Some(task_id))
            .count()
    }

    #[test]
    fn first_idle_agent_by_name_wins() {
        let mut board = board();
        assert_eq!(match_task(&mut board, 100), Some(3));
        assert_eq!(match_task(&mut board, 101), Some(2));
        assert_eq!(holders(&board, 100), 1);
    }

    #[test]
    fn matching_is_idempotent() {
        let mut board = board();
        match_task(&mut board, 100);
        let before = board.clone();
        assert_eq!(match_task(&mut board, 100), Some(3));
        assert_eq!(board, before);
    }

    #[test]
    fn stale_holder_is_released_and_task_reoffered() {
        let mut board = board();
        match_task(&mut board, 100);
        board.tasks.get_mut(&100).unwrap().status_id = 11;

        assert_eq!(match_task(&mut board, 100), Some(4));
        assert_eq!(board.agents[&3].current_task, None);
        assert_eq!(holders(&board, 100), 1);
    }

    #[test]
    fn no_idle_agent_leaves_task_unassigned() {
        let mut board = board();
        board.agents.remove(&2);
        assert_eq!(match_task(&mut board, 100), Some(3));
        assert_eq!(match_task(&mut board, 101), None);
        assert_eq!(waiting_for(&board, 3), vec![101]);
    }

    #[test]
    fn unknown_task_matches_nothing() {
        let mut board = board();
        assert_eq!(match_task(&mut board, 999), None);
    }
}
