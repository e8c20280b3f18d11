use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::model::{AgentId, Board};

/// Everything an agent's compiled instructions are derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionInputs {
    pub base: String,
    pub role_instruction: String,
    pub acceptance_criteria: String,
    pub transfer_criteria: String,
}

impl InstructionInputs {
    pub fn for_agent(board: &Board, agent_id: AgentId) -> Option<Self> {
        let agent = board.agents.get(&agent_id)?;
        let role_instruction = agent
            .role_id
            .and_then(|id| board.roles.get(&id))
            .map(|role| role.instruction.clone())
            .unwrap_or_default();

        Some(Self {
            base: board.settings.base_instructions.clone(),
            role_instruction,
            acceptance_criteria: agent.acceptance_criteria.clone(),
            transfer_criteria: agent.transfer_criteria.clone(),
        })
    }
}

pub fn build_instructions(inputs: &InstructionInputs) -> String {
    let acceptance = inputs.acceptance_criteria.trim();
    let transfer = inputs.transfer_criteria.trim();

    let mut parts = vec![
        inputs.base.trim().to_string(),
        inputs.role_instruction.trim().to_string(),
    ];
    if !acceptance.is_empty() {
        parts.push(format!("Acceptance criteria: {acceptance}"));
    }
    if !transfer.is_empty() {
        parts.push(format!("Transfer criteria: {transfer}"));
    }

    parts.retain(|part| !part.is_empty());
    parts.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub instructions: String,
    pub api_key: String,
    pub model: String,
    inputs: InstructionInputs,
}

/// Compiled per-agent execution contexts, rebuilt whenever their inputs,
/// credential or model change.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    entries: Mutex<HashMap<AgentId, ExecutionContext>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &self,
        agent_id: AgentId,
        inputs: &InstructionInputs,
        api_key: &str,
        model: &str,
    ) -> ExecutionContext {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(cached) = entries.get(&agent_id) {
            if cached.inputs == *inputs && cached.api_key == api_key && cached.model == model {
                return cached.clone();
            }
        }

        debug!(agent_id, "compiling execution context");
        let context = ExecutionContext {
            instructions: build_instructions(inputs),
            api_key: api_key.to_string(),
            model: model.to_string(),
            inputs: inputs.clone(),
        };
        entries.insert(agent_id, context.clone());
        context
    }

    pub fn invalidate(&self, agent_id: AgentId) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&agent_id);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn get(&self, agent_id: AgentId) -> Option<ExecutionContext> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .cloned()
    }
}
