use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kb_mcp_core::{text_result, McpResult, McpTool};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::errors::{string_list, ToolError, ToolResult};
use crate::exec::run_process;
use crate::root::SandboxRoot;

const DEFAULT_USER_NAME: &str = "codex-agent";
const DEFAULT_USER_EMAIL: &str = "codex-agent@localhost";

/// `run_git`: git inside the sandbox root. The repository and a commit identity
/// are created on first use.
pub struct RunGitTool {
    root: Arc<SandboxRoot>,
    timeout: Duration,
}

impl RunGitTool {
    pub fn new(root: Arc<SandboxRoot>, timeout: Duration) -> Self {
        Self { root, timeout }
    }

    pub async fn run(&self, args: &[String]) -> ToolResult<String> {
        let _guard = self.root.lock().await?;
        self.ensure_repository().await?;

        let result = run_process("git", args, self.root.path(), self.timeout).await?;
        info!(
            tool = "run_git",
            args = ?args,
            exit_code = ?result.code,
            "git finished"
        );

        if !result.success() {
            return Err(ToolError::CommandFailed {
                program: "git".into(),
                code: result.code,
                output: result.output,
            });
        }

        if result.output.is_empty() {
            Ok("ok".to_string())
        } else {
            Ok(result.output)
        }
    }

    async fn ensure_repository(&self) -> ToolResult<()> {
        let root = self.root.path();
        if !root.join(".git").exists() {
            debug!(root = %root.display(), "initializing sandbox repository");
            let init = run_process("git", &owned(&["init"]), root, self.timeout).await?;
            if !init.success() {
                return Err(ToolError::CommandFailed {
                    program: "git".into(),
                    code: init.code,
                    output: init.output,
                });
            }
        }

        for (key, fallback) in [
            ("user.name", DEFAULT_USER_NAME),
            ("user.email", DEFAULT_USER_EMAIL),
        ] {
            let current =
                run_process("git", &owned(&["config", "--get", key]), root, self.timeout).await?;
            if !current.success() {
                // best effort; a failing commit will surface the real problem
                let _ = run_process("git", &owned(&["config", key, fallback]), root, self.timeout)
                    .await;
            }
        }
        Ok(())
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[async_trait]
impl McpTool for RunGitTool {
    fn name(&self) -> &str {
        "run_git"
    }

    fn description(&self) -> &str {
        "Run a git command inside the sandbox directory."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let args = string_list(&params, "args")?;
        let output = self.run(&args).await?;
        Ok(text_result(output))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Arguments passed to git, e.g. [\"commit\", \"-m\", \"msg\"]"
                }
            },
            "required": ["args"],
            "additionalProperties": false
        })
    }
}
