use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::{AgentId, ProjectId, RoleId, StatusId, TaskId};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project {0} not found")]
    UnknownProject(ProjectId),

    #[error("status {0} not found")]
    UnknownStatus(StatusId),

    #[error("role {0} not found")]
    UnknownRole(RoleId),

    #[error("agent {0} not found")]
    UnknownAgent(AgentId),

    #[error("task {0} not found")]
    UnknownTask(TaskId),

    #[error("status {status} does not belong to project {project}")]
    CrossProject { status: StatusId, project: ProjectId },

    #[error("{0}")]
    Invalid(String),

    #[error("store state poisoned")]
    Poisoned,

    #[error("snapshot I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot is not valid JSON: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Failure of one exchange with the sandbox server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn sandbox server: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("sandbox channel I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox server closed the channel")]
    Closed,

    #[error("no response within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("{0}")]
    ToolFailed(String),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Missing credential or model; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

impl ExecutorError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, ExecutorError::Configuration(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
