use std::sync::Arc;

use async_trait::async_trait;
use kb_mcp_core::{McpError, McpResult, McpTool, RunCodexArgs, RUN_CODEX_TOOL};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::chat::{ChatBackend, ChatMessage, ChatRequest, ToolCall};
use crate::errors::validation_error;
use crate::server::ToolRegistry;

pub const DEFAULT_MAX_TURNS: usize = 32;

const SANDBOX_NOTE: &str = "Working folder: sandbox. Use list_files/read_file/write_file/make_dir \
for files, run_git for commits and run_cmd for other commands.";

/// `run_codex`: runs the remote agent model against the sandbox tool table until
/// it produces a final answer.
pub struct RunCodexTool {
    tools: ToolRegistry,
    backend: Arc<dyn ChatBackend>,
    max_turns: usize,
}

impl RunCodexTool {
    pub fn new(tools: ToolRegistry, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            tools,
            backend,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub async fn run(&self, args: &RunCodexArgs) -> McpResult<String> {
        if args.prompt.is_empty() {
            return Ok(String::new());
        }
        if args.api_key.is_empty() {
            return Err(validation_error("API key is not configured."));
        }
        if args.model.is_empty() {
            return Err(validation_error("Model is not configured."));
        }

        let instructions = [args.instructions.trim(), SANDBOX_NOTE]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let descriptors = self.tools.descriptors();
        let mut messages = vec![
            ChatMessage::system(instructions),
            ChatMessage::user(args.prompt.clone()),
        ];

        info!(
            task_id = ?args.task_id,
            status_id = ?args.status_id,
            model = %args.model,
            "starting agent run"
        );

        for turn in 0..self.max_turns {
            let reply = self
                .backend
                .complete(ChatRequest {
                    api_key: &args.api_key,
                    model: &args.model,
                    messages: &messages,
                    tools: &descriptors,
                })
                .await
                .map_err(|err| McpError::ExecutionFailed(err.to_string()))?;

            if reply.tool_calls.is_empty() {
                debug!(turn, "agent produced final answer");
                return Ok(reply.content.unwrap_or_default());
            }

            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in &calls {
                let output = self.dispatch(call).await;
                messages.push(ChatMessage::tool(call.id.clone(), output));
            }
        }

        Err(McpError::ExecutionFailed(format!(
            "agent did not finish within {} turns",
            self.max_turns
        )))
    }

    /// Executes one tool call; failures are returned to the model as text so it
    /// can recover within its own turn.
    async fn dispatch(&self, call: &ToolCall) -> String {
        let name = call.function.name.as_str();
        let Some(tool) = self.tools.get(name) else {
            return format!("Error: unknown tool '{name}'");
        };

        let arguments = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(value) => value,
                Err(err) => return format!("Error: invalid JSON arguments: {err}"),
            }
        };

        match tool.execute(arguments).await {
            Ok(result) => collect_text(&result),
            Err(err) => {
                warn!(tool = name, "tool call failed: {}", err);
                format!("Error: {}", err.message())
            }
        }
    }
}

fn collect_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[async_trait]
impl McpTool for RunCodexTool {
    fn name(&self) -> &str {
        RUN_CODEX_TOOL
    }

    fn description(&self) -> &str {
        "Run a prompt through the agent model with the sandbox tools available."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let args: RunCodexArgs = serde_json::from_value(params)
            .map_err(|err| McpError::InvalidRequest(format!("invalid run_codex arguments: {err}")))?;
        let text = self.run(&args).await?;
        Ok(json!({
            "content": [{"type": "text", "text": text}],
            "structuredContent": {"text": text}
        }))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string"},
                "instructions": {"type": "string"},
                "api_key": {"type": "string"},
                "model": {"type": "string"},
                "task_id": {"type": ["integer", "null"]},
                "status_id": {"type": ["integer", "null"]}
            },
            "required": ["prompt"]
        })
    }
}
