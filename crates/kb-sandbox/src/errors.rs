use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use kb_mcp_core::McpError;
use serde_json::{json, Value};
use thiserror::Error;

pub type ToolResult<T> = Result<T, ToolError>;

/// Failure of a single sandbox tool call. These are reported back to the remote
/// agent as tool-call failures; they never end an orchestration run by themselves.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Absolute paths are not allowed: {0}")]
    AbsolutePath(String),

    #[error("Path escapes sandbox: {0}")]
    PathEscape(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error("Path does not exist: {0}")]
    NotFound(String),

    #[error("File does not exist: {0}")]
    NotAFile(String),

    #[error("I/O error during {operation} on {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", failure_text(program, *code, output))]
    CommandFailed {
        program: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
}

fn failure_text(program: &str, code: Option<i32>, output: &str) -> String {
    if !output.is_empty() {
        return output.to_string();
    }
    match code {
        Some(code) => format!("{program} exited with {code}"),
        None => format!("{program} terminated by signal"),
    }
}

impl ToolError {
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ToolError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// True for sandbox-boundary violations.
    pub fn is_path_escape(&self) -> bool {
        matches!(self, ToolError::PathEscape(_) | ToolError::AbsolutePath(_))
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ToolError::AbsolutePath(_) | ToolError::PathEscape(_) => "E_PATH_ESCAPE",
            ToolError::InvalidArguments(_) => "E_VALIDATION",
            ToolError::NotFound(_) | ToolError::NotAFile(_) => "E_NOT_FOUND",
            ToolError::Io { .. } => "E_IO",
            ToolError::CommandFailed { .. } => "E_COMMAND_FAILED",
            ToolError::Timeout { .. } => "E_TIMEOUT",
        }
    }

    fn rpc_code(&self) -> i32 {
        match self {
            ToolError::InvalidArguments(_) => -32602,
            _ => -32001,
        }
    }
}

impl From<ToolError> for McpError {
    fn from(err: ToolError) -> Self {
        let message = err.to_string();
        let mut data = json!({
            "code": err.tag(),
            "message": message,
            "timestamp": current_timestamp(),
        });

        match &err {
            ToolError::CommandFailed { program, code, .. } => {
                data["details"] = json!({ "program": program, "exit_code": code });
            }
            ToolError::Timeout { program, secs } => {
                data["details"] = json!({ "program": program, "timeout_secs": secs });
            }
            ToolError::Io {
                operation, path, ..
            } => {
                data["details"] = json!({
                    "operation": operation,
                    "path": path.to_string_lossy(),
                });
            }
            _ => {}
        }

        McpError::rpc(err.rpc_code(), message, Some(data))
    }
}

pub fn validation_error(message: impl Into<String>) -> McpError {
    ToolError::InvalidArguments(message.into()).into()
}

/// Reads a required string parameter.
pub fn required_str<'a>(params: &'a Value, key: &str) -> ToolResult<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' must be a string")))
}

/// Reads a `list[str]` parameter; any non-string element is rejected.
pub fn string_list(params: &Value, key: &str) -> ToolResult<Vec<String>> {
    let items = params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::InvalidArguments(format!("{key} must be a list of strings.")))?;

    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ToolError::InvalidArguments(format!("{key} must be a list of strings."))
            })
        })
        .collect()
}

fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_escape_maps_to_tagged_rpc_error() {
        let err: McpError = ToolError::PathEscape("../x".into()).into();
        assert_eq!(err.code(), -32001);
        assert_eq!(err.tag().as_deref(), Some("E_PATH_ESCAPE"));
        assert!(err.message().contains("../x"));
    }

    #[test]
    fn command_failure_without_output_reports_exit_code() {
        let err = ToolError::CommandFailed {
            program: "git".into(),
            code: Some(128),
            output: String::new(),
        };
        assert_eq!(err.to_string(), "git exited with 128");
    }

    #[test]
    fn string_list_rejects_mixed_arrays() {
        let params = json!({"args": ["status", 3]});
        let err = string_list(&params, "args").unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let params = json!({"args": ["log", "-1"]});
        assert_eq!(string_list(&params, "args").unwrap(), vec!["log", "-1"]);
    }
}
