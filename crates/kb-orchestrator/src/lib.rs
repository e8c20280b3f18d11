//! Task orchestration for a kanban board worked by automation agents.
//!
//! A status write on a task schedules a run. The run claims an idle agent
//! watching that status, sends the task to the sandbox server, reads the
//! completion marker from the answer and moves the task to the agent's success
//! or error status. Freed agents then pick up whatever is waiting for them.

pub mod applier;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod matcher;
pub mod model;
pub mod observer;
pub mod orchestrator;
pub mod outcome;
pub mod store;
pub mod tracker;
pub mod transport;

pub use config::OrchestratorConfig;
pub use error::{ConfigError, ExecutorError, StoreError, TransportError};
pub use events::{Event, NotificationHub};
pub use executor::{PromptExecutor, RetryPolicy};
pub use orchestrator::{Orchestrator, OrchestratorOptions, ScheduleOutcome};
pub use outcome::{interpret, Completion, MissingMarker};
pub use store::{AgentSpec, StatusChange, Store, TaskSpec};
pub use transport::{StdioTransport, Transport};
