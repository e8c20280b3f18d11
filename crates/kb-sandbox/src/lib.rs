//! Sandbox tool server: file, git and command tools confined to one directory,
//! plus the `run_codex` agent loop, all served over line-delimited JSON-RPC.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kb_mcp_core::McpTool;

pub mod chat;
pub mod codex;
pub mod errors;
pub mod exec;
pub mod files;
pub mod git;
pub mod root;
pub mod server;

pub use chat::{ChatBackend, ChatError, ChatMessage, OpenAiBackend};
pub use codex::RunCodexTool;
pub use errors::{ToolError, ToolResult};
pub use root::SandboxRoot;
pub use server::{McpServer, ToolRegistry};

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub root: PathBuf,
    pub command_timeout: Duration,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("sandbox"),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }
}

/// The tools the remote agent may call while working a task.
pub fn sandbox_tools(root: Arc<SandboxRoot>, options: &SandboxOptions) -> Vec<Arc<dyn McpTool>> {
    vec![
        Arc::new(files::ListFilesTool::new(Arc::clone(&root))),
        Arc::new(files::ReadFileTool::new(Arc::clone(&root))),
        Arc::new(files::WriteFileTool::new(Arc::clone(&root))),
        Arc::new(files::MakeDirTool::new(Arc::clone(&root))),
        Arc::new(git::RunGitTool::new(
            Arc::clone(&root),
            options.command_timeout,
        )),
        Arc::new(exec::RunCmdTool::new(root, options.command_timeout)),
    ]
}

/// Full table exposed to the orchestrator: the sandbox tools and `run_codex`
/// driving them through `backend`.
pub fn server_registry(
    options: &SandboxOptions,
    backend: Arc<dyn ChatBackend>,
) -> ToolResult<ToolRegistry> {
    let root = Arc::new(SandboxRoot::open(&options.root)?);
    let mut tools = sandbox_tools(root, options);
    let agent = RunCodexTool::new(ToolRegistry::new(tools.clone()), backend);
    tools.push(Arc::new(agent));
    Ok(ToolRegistry::new(tools))
}
