use std::sync::Arc;
use std::time::Duration;

use kb_mcp_core::RunCodexArgs;
use tracing::{debug, info, warn};

use crate::context::{ContextRegistry, InstructionInputs};
use crate::error::{ExecutorError, TransportError};
use crate::model::{AgentId, StatusId, TaskId};
use crate::outcome::MARKER_INSTRUCTION;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Wall-clock bound for one attempt.
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after the zero-based `attempt` failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * (attempt + 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 4,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Inputs of one prompt execution for one agent.
#[derive(Debug, Clone)]
pub struct PromptRequest<'a> {
    pub agent_id: AgentId,
    pub inputs: &'a InstructionInputs,
    pub api_key: &'a str,
    pub model: &'a str,
    pub prompt: &'a str,
    pub task_id: Option<TaskId>,
    pub status_id: Option<StatusId>,
}

pub struct PromptExecutor {
    transport: Arc<dyn Transport>,
    contexts: ContextRegistry,
    policy: RetryPolicy,
}

impl PromptExecutor {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            contexts: ContextRegistry::new(),
            policy,
        }
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn run(&self, request: PromptRequest<'_>) -> Result<String, ExecutorError> {
        if request.api_key.trim().is_empty() {
            return Err(ExecutorError::Configuration("API key is not configured".into()));
        }
        if request.model.trim().is_empty() {
            return Err(ExecutorError::Configuration("model is not configured".into()));
        }

        let context = self.contexts.resolve(
            request.agent_id,
            request.inputs,
            request.api_key,
            request.model,
        );
        let args = RunCodexArgs {
            prompt: format!("{}\n\n{}", request.prompt, MARKER_INSTRUCTION),
            instructions: context.instructions,
            api_key: context.api_key,
            model: context.model,
            task_id: request.task_id,
            status_id: request.status_id,
        };

        let attempts = self.policy.max_retries + 1;
        let mut attempt = 0;
        loop {
            debug!(task_id = ?request.task_id, attempt, "calling sandbox server");
            let error = match tokio::time::timeout(self.policy.timeout, self.transport.run_codex(&args))
                .await
            {
                Ok(Ok(text)) => {
                    info!(task_id = ?request.task_id, attempt, "agent responded");
                    return Ok(text);
                }
                Ok(Err(err)) => err,
                Err(_) => TransportError::Timeout(self.policy.timeout),
            };

            if attempt + 1 >= attempts {
                warn!(task_id = ?request.task_id, attempts, "giving up: {}", error);
                return Err(ExecutorError::Transport {
                    attempts,
                    source: error,
                });
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                task_id = ?request.task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "sandbox call failed, retrying: {}",
                error
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
