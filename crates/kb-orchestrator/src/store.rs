use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::matcher::release_stale;
use crate::model::{
    Agent, AgentId, Board, Message, Project, ProjectId, Role, RoleId, Status, StatusId, Task,
    TaskId,
};

/// A committed change of one task's status. `from` is `None` for a task that was
/// just created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub task_id: TaskId,
    pub from: Option<StatusId>,
    pub to: StatusId,
}

/// Fields of an agent as submitted by a create/update command.
#[derive(Debug, Clone, Default)]
pub struct AgentSpec {
    pub name: String,
    pub project_id: ProjectId,
    pub role_id: Option<RoleId>,
    pub working_status: Option<StatusId>,
    pub success_status: Option<StatusId>,
    pub error_status: Option<StatusId>,
    pub acceptance_criteria: String,
    pub transfer_criteria: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub title: String,
    pub project_id: ProjectId,
    pub status_id: StatusId,
    /// Opening message and its author.
    pub message: Option<(AgentId, String)>,
}

#[derive(Debug, Clone)]
pub enum Setting {
    BaseInstructions(String),
}

/// In-memory board guarded by one lock. Every command runs in [`Store::transact`]:
/// it mutates a copy and the copy replaces the state only if the command
/// succeeds, so a failed command leaves nothing half-applied.
#[derive(Debug, Default)]
pub struct Store {
    state: Mutex<Board>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_board(board: Board) -> Self {
        Self {
            state: Mutex::new(board),
        }
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no snapshot yet, starting empty");
            return Ok(Self::new());
        }
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let board: Board = serde_json::from_str(&raw)?;
        Ok(Self::from_board(board))
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let board = self.snapshot()?;
        let json = serde_json::to_string_pretty(&board)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "snapshot saved");
        Ok(())
    }

    pub fn snapshot(&self) -> StoreResult<Board> {
        self.read(Board::clone)
    }

    pub fn read<T>(&self, f: impl FnOnce(&Board) -> T) -> StoreResult<T> {
        let state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&state))
    }

    pub fn transact<T>(&self, f: impl FnOnce(&mut Board) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let mut draft = state.clone();
        let value = f(&mut draft)?;
        *state = draft;
        Ok(value)
    }

    pub fn create_project(&self, name: &str) -> StoreResult<Project> {
        let name = non_empty(name, "project name")?;
        self.transact(|board| {
            let project = Project {
                id: board.allocate_id(),
                name,
            };
            board.projects.insert(project.id, project.clone());
            Ok(project)
        })
    }

    pub fn create_status(
        &self,
        project_id: ProjectId,
        name: &str,
        color: &str,
    ) -> StoreResult<Status> {
        let name = non_empty(name, "status name")?;
        self.transact(|board| {
            if !board.projects.contains_key(&project_id) {
                return Err(StoreError::UnknownProject(project_id));
            }
            let status = Status {
                id: board.allocate_id(),
                name,
                color: color.trim().to_string(),
                project_id,
            };
            board.statuses.insert(status.id, status.clone());
            Ok(status)
        })
    }

    pub fn create_role(&self, name: &str, instruction: &str) -> StoreResult<Role> {
        let name = non_empty(name, "role name")?;
        self.transact(|board| {
            let role = Role {
                id: board.allocate_id(),
                name,
                instruction: instruction.to_string(),
            };
            board.roles.insert(role.id, role.clone());
            Ok(role)
        })
    }

    /// Returns the agents whose compiled instructions depend on this role.
    pub fn update_role_instruction(
        &self,
        role_id: RoleId,
        instruction: &str,
    ) -> StoreResult<Vec<AgentId>> {
        self.transact(|board| {
            let role = board
                .roles
                .get_mut(&role_id)
                .ok_or(StoreError::UnknownRole(role_id))?;
            role.instruction = instruction.to_string();
            Ok(board
                .agents
                .values()
                .filter(|agent| agent.role_id == Some(role_id))
                .map(|agent| agent.id)
                .collect())
        })
    }

    pub fn create_agent(&self, spec: AgentSpec) -> StoreResult<Agent> {
        self.transact(|board| {
            validate_agent(board, &spec)?;
            let agent = Agent {
                id: board.allocate_id(),
                name: spec.name.trim().to_string(),
                role_id: spec.role_id,
                project_id: spec.project_id,
                working_status: spec.working_status,
                success_status: spec.success_status,
                error_status: spec.error_status,
                current_task: None,
                acceptance_criteria: spec.acceptance_criteria,
                transfer_criteria: spec.transfer_criteria,
                api_key: spec.api_key,
                model: spec.model,
            };
            board.agents.insert(agent.id, agent.clone());
            Ok(agent)
        })
    }

    /// Replaces an agent's fields. Moving its working status releases any task it
    /// holds.
    pub fn update_agent(&self, agent_id: AgentId, spec: AgentSpec) -> StoreResult<Agent> {
        self.transact(|board| {
            validate_agent(board, &spec)?;
            let agent = board
                .agents
                .get_mut(&agent_id)
                .ok_or(StoreError::UnknownAgent(agent_id))?;

            if agent.working_status != spec.working_status && agent.current_task.is_some() {
                debug!(agent = %agent.name, "working status changed, releasing task");
                agent.current_task = None;
            }
            agent.name = spec.name.trim().to_string();
            agent.role_id = spec.role_id;
            agent.project_id = spec.project_id;
            agent.working_status = spec.working_status;
            agent.success_status = spec.success_status;
            agent.error_status = spec.error_status;
            agent.acceptance_criteria = spec.acceptance_criteria;
            agent.transfer_criteria = spec.transfer_criteria;
            agent.api_key = spec.api_key;
            agent.model = spec.model;
            Ok(agent.clone())
        })
    }

    pub fn delete_agent(&self, agent_id: AgentId) -> StoreResult<Agent> {
        self.transact(|board| {
            board
                .agents
                .remove(&agent_id)
                .ok_or(StoreError::UnknownAgent(agent_id))
        })
    }

    pub fn create_task(&self, spec: TaskSpec) -> StoreResult<(Task, StatusChange)> {
        let title = non_empty(&spec.title, "task title")?;
        self.transact(|board| {
            ensure_status_in_project(board, spec.status_id, spec.project_id)?;
            let task = Task {
                id: board.allocate_id(),
                title,
                project_id: spec.project_id,
                status_id: spec.status_id,
            };
            board.tasks.insert(task.id, task.clone());

            if let Some((author_id, text)) = spec.message {
                push_message(board, task.id, author_id, text)?;
            }

            let change = StatusChange {
                task_id: task.id,
                from: None,
                to: task.status_id,
            };
            Ok((task, change))
        })
    }

    /// Direct status write. Returns `None` when the task already had that status.
    pub fn update_task_status(
        &self,
        task_id: TaskId,
        status_id: StatusId,
    ) -> StoreResult<Option<StatusChange>> {
        let changes = self.apply_status_updates(&[(task_id, status_id)])?;
        Ok(changes.into_iter().next())
    }

    /// Commits several status writes at once. Writes to the same task collapse to
    /// the last one; tasks that end where they started are not reported. A moved
    /// task's holder is released in the same write when it no longer watches the
    /// new status.
    pub fn apply_status_updates(
        &self,
        updates: &[(TaskId, StatusId)],
    ) -> StoreResult<Vec<StatusChange>> {
        self.transact(|board| {
            let mut original: BTreeMap<TaskId, StatusId> = BTreeMap::new();

            for &(task_id, status_id) in updates {
                let task = board
                    .tasks
                    .get(&task_id)
                    .ok_or(StoreError::UnknownTask(task_id))?;
                ensure_status_in_project(board, status_id, task.project_id)?;
                original.entry(task_id).or_insert(task.status_id);

                if let Some(task) = board.tasks.get_mut(&task_id) {
                    task.status_id = status_id;
                }
            }

            let changes: Vec<StatusChange> = original
                .into_iter()
                .filter_map(|(task_id, from)| {
                    let to = board.tasks.get(&task_id)?.status_id;
                    (to != from).then_some(StatusChange {
                        task_id,
                        from: Some(from),
                        to,
                    })
                })
                .collect();
            for change in &changes {
                release_stale(board, change.task_id);
            }
            Ok(changes)
        })
    }

    pub fn delete_task(&self, task_id: TaskId) -> StoreResult<Task> {
        self.transact(|board| {
            let task = board
                .tasks
                .remove(&task_id)
                .ok_or(StoreError::UnknownTask(task_id))?;
            for agent in board.agents.values_mut() {
                if agent.current_task == Some(task_id) {
                    agent.current_task = None;
                }
            }
            board.messages.retain(|message| message.task_id != task_id);
            Ok(task)
        })
    }

    pub fn add_message(
        &self,
        task_id: TaskId,
        author_id: AgentId,
        text: &str,
    ) -> StoreResult<Message> {
        self.transact(|board| push_message(board, task_id, author_id, text.to_string()))
    }

    pub fn set_setting(&self, setting: Setting) -> StoreResult<()> {
        self.transact(|board| {
            match setting {
                Setting::BaseInstructions(text) => board.settings.base_instructions = text,
            }
            Ok(())
        })
    }
}

pub(crate) fn push_message(
    board: &mut Board,
    task_id: TaskId,
    author_id: AgentId,
    text: String,
) -> StoreResult<Message> {
    if !board.tasks.contains_key(&task_id) {
        return Err(StoreError::UnknownTask(task_id));
    }
    if !board.agents.contains_key(&author_id) {
        return Err(StoreError::UnknownAgent(author_id));
    }
    let message = Message {
        id: board.allocate_id(),
        task_id,
        author_id,
        text,
        created_at: Utc::now(),
    };
    board.messages.push(message.clone());
    Ok(message)
}

fn non_empty(value: &str, what: &str) -> StoreResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Invalid(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn ensure_status_in_project(
    board: &Board,
    status_id: StatusId,
    project_id: ProjectId,
) -> StoreResult<()> {
    if !board.projects.contains_key(&project_id) {
        return Err(StoreError::UnknownProject(project_id));
    }
    let status = board
        .statuses
        .get(&status_id)
        .ok_or(StoreError::UnknownStatus(status_id))?;
    if status.project_id != project_id {
        return Err(StoreError::CrossProject {
            status: status_id,
            project: project_id,
        });
    }
    Ok(())
}

fn validate_agent(board: &Board, spec: &AgentSpec) -> StoreResult<()> {
    if spec.name.trim().is_empty() {
        return Err(StoreError::Invalid("agent name must not be empty".into()));
    }
    if let Some(role_id) = spec.role_id {
        if !board.roles.contains_key(&role_id) {
            return Err(StoreError::UnknownRole(role_id));
        }
    }
    for status_id in [spec.working_status, spec.success_status, spec.error_status]
        .into_iter()
        .flatten()
    {
        ensure_status_in_project(board, status_id, spec.project_id)?;
    }
    Ok(())
}
