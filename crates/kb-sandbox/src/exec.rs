use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kb_mcp_core::{text_result, McpResult, McpTool};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::info;

use crate::errors::{string_list, ToolError, ToolResult};
use crate::root::SandboxRoot;

/// Exit status plus merged stdout/stderr of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub output: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs `program args…` in `cwd`, killing it once `timeout` elapses.
pub async fn run_process(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> ToolResult<ProcessOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|err| ToolError::io("spawn process", cwd, err))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|err| ToolError::io("wait for process", cwd, err))?,
        Err(_) => {
            return Err(ToolError::Timeout {
                program: program.to_string(),
                secs: timeout.as_secs(),
            })
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ProcessOutput {
        code: output.status.code(),
        output: combined.trim().to_string(),
        duration: start.elapsed(),
    })
}

/// `run_cmd`: arbitrary command execution inside the sandbox.
pub struct RunCmdTool {
    root: Arc<SandboxRoot>,
    default_timeout: Duration,
}

impl RunCmdTool {
    pub fn new(root: Arc<SandboxRoot>, default_timeout: Duration) -> Self {
        Self {
            root,
            default_timeout,
        }
    }

    pub async fn run(
        &self,
        args: &[String],
        cwd: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> ToolResult<String> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| ToolError::InvalidArguments("args must not be empty.".into()))?;

        let working_dir = match cwd {
            Some(raw) => self.root.resolve(raw)?,
            None => self.root.path().to_path_buf(),
        };
        if !working_dir.is_dir() {
            return Err(ToolError::NotFound(self.root.relative(&working_dir)));
        }

        let timeout = timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let _guard = self.root.lock().await?;
        let result = run_process(program, rest, &working_dir, timeout).await?;

        info!(
            tool = "run_cmd",
            program = %program,
            exit_code = ?result.code,
            duration_ms = result.duration.as_millis() as u64,
            "command finished"
        );

        if !result.success() {
            return Err(ToolError::CommandFailed {
                program: program.clone(),
                code: result.code,
                output: result.output,
            });
        }
        Ok(result.output)
    }
}

#[async_trait]
impl McpTool for RunCmdTool {
    fn name(&self) -> &str {
        "run_cmd"
    }

    fn description(&self) -> &str {
        "Run a command inside the sandbox directory and return its combined output."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let args = string_list(&params, "args")?;
        let cwd = params.get("cwd").and_then(Value::as_str);
        let timeout = params.get("timeout").and_then(Value::as_u64);
        let output = self.run(&args, cwd, timeout).await?;
        Ok(text_result(output))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Program followed by its arguments"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory relative to the sandbox root"
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Timeout in seconds"
                }
            },
            "required": ["args"],
            "additionalProperties": false
        })
    }
}
