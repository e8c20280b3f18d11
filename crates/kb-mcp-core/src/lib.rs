//! Shared pieces of the sandbox JSON-RPC protocol: the tool trait every sandbox
//! tool implements, the error type carried back to callers, and the typed
//! `run_codex` payload exchanged between the orchestrator and the sandbox server.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub mod protocol;

pub use protocol::{RunCodexArgs, JSONRPC_VERSION, PROTOCOL_VERSION, RUN_CODEX_TOOL};

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("{message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl McpError {
    pub fn code(&self) -> i32 {
        match self {
            McpError::InvalidRequest(_) => -32600,
            McpError::ToolNotFound(_) => -32601,
            McpError::ExecutionFailed(_) => -32001,
            McpError::Rpc { code, .. } => *code,
        }
    }

    pub fn message(&self) -> String {
        match self {
            McpError::InvalidRequest(msg)
            | McpError::ToolNotFound(msg)
            | McpError::ExecutionFailed(msg) => msg.clone(),
            McpError::Rpc { message, .. } => message.clone(),
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            McpError::Rpc { data, .. } => data.clone(),
            _ => None,
        }
    }

    /// Machine-readable error tag (`data.code`), when the error carries one.
    pub fn tag(&self) -> Option<String> {
        self.data()
            .as_ref()
            .and_then(|data| data.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn rpc<D: Into<Option<Value>>, M: Into<String>>(code: i32, message: M, data: D) -> Self {
        McpError::Rpc {
            code,
            message: message.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[async_trait]
pub trait McpTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, params: Value) -> McpResult<Value>;
    fn input_schema(&self) -> Value;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Wraps plain text into the `content` block shape every tool result uses.
pub fn text_result(text: impl Into<String>) -> Value {
    serde_json::json!({
        "content": [{
            "type": "text",
            "text": text.into()
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_error_exposes_tag_from_data() {
        let err = McpError::rpc(-32001, "boom", Some(json!({"code": "E_TIMEOUT"})));
        assert_eq!(err.code(), -32001);
        assert_eq!(err.message(), "boom");
        assert_eq!(err.tag().as_deref(), Some("E_TIMEOUT"));
    }

    #[test]
    fn plain_variants_have_no_tag() {
        let err = McpError::ToolNotFound("nope".into());
        assert_eq!(err.code(), -32601);
        assert!(err.tag().is_none());
    }
}
