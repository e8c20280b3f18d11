use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ProjectId = u64;
pub type StatusId = u64;
pub type RoleId = u64;
pub type AgentId = u64;
pub type TaskId = u64;
pub type MessageId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
}

/// A kanban column; also the "working state" an agent watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: StatusId,
    pub name: String,
    #[serde(default)]
    pub color: String,
    pub project_id: ProjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    #[serde(default)]
    pub instruction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub role_id: Option<RoleId>,
    pub project_id: ProjectId,
    #[serde(default)]
    pub working_status: Option<StatusId>,
    #[serde(default)]
    pub success_status: Option<StatusId>,
    #[serde(default)]
    pub error_status: Option<StatusId>,
    /// Set only by the matcher; cleared by the matcher, a transition or task deletion.
    #[serde(default)]
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(default)]
    pub transfer_criteria: String,
    /// Per-agent overrides of the configured credential and model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Agent {
    pub fn is_idle(&self) -> bool {
        self.current_task.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub project_id: ProjectId,
    pub status_id: StatusId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub task_id: TaskId,
    pub author_id: AgentId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub base_instructions: String,
}

/// Everything the store persists. Ids come from one shared counter, so message
/// ids are monotonic in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    #[serde(default)]
    pub projects: BTreeMap<ProjectId, Project>,
    #[serde(default)]
    pub statuses: BTreeMap<StatusId, Status>,
    #[serde(default)]
    pub roles: BTreeMap<RoleId, Role>,
    #[serde(default)]
    pub agents: BTreeMap<AgentId, Agent>,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    next_id: u64,
}

impl Board {
    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn messages_for(&self, task_id: TaskId) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(move |message| message.task_id == task_id)
    }

    pub fn holder_of(&self, task_id: TaskId) -> Option<&Agent> {
        self.agents
            .values()
            .find(|agent| agent.current_task == Some(task_id))
    }

    pub fn status_name(&self, status_id: StatusId) -> &str {
        self.statuses
            .get(&status_id)
            .map(|status| status.name.as_str())
            .unwrap_or("?")
    }

    pub fn agent_name(&self, agent_id: AgentId) -> String {
        self.agents
            .get(&agent_id)
            .map(|agent| agent.name.clone())
            .unwrap_or_else(|| format!("agent #{agent_id}"))
    }
}
