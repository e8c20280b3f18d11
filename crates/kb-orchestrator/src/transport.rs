//! Client side of the sandbox JSON-RPC channel.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use kb_mcp_core::{RunCodexArgs, JSONRPC_VERSION, PROTOCOL_VERSION, RUN_CODEX_TOOL};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TransportError;

/// One `run_codex` exchange with a sandbox server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn run_codex(&self, args: &RunCodexArgs) -> Result<String, TransportError>;
}

/// Spawns a fresh sandbox server per call and talks to it over its stdio.
#[derive(Debug, Clone)]
pub struct StdioTransport {
    command: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl StdioTransport {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn run_codex(&self, args: &RunCodexArgs) -> Result<String, TransportError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(TransportError::Spawn)?;

        let stdin = child.stdin.take().ok_or(TransportError::Closed)?;
        let stdout = child.stdout.take().ok_or(TransportError::Closed)?;
        debug!(command = %self.command.display(), pid = ?child.id(), "sandbox server spawned");

        let result = async {
            let mut session = McpSession::new(stdout, stdin);
            session.initialize().await?;
            session.run_codex(args).await
        }
        .await;

        if let Err(err) = child.kill().await {
            debug!("sandbox server already exited: {}", err);
        }
        result
    }
}

#[derive(Deserialize)]
struct RawRpcResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RawRpcError>,
}

#[derive(Deserialize)]
struct RawRpcError {
    code: i64,
    message: String,
}

/// Line-delimited JSON-RPC client over any byte stream pair.
pub struct McpSession<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
}

impl<R, W> McpSession<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    /// `initialize`, the initialized notification, then `tools/list` to confirm
    /// `run_codex` is offered.
    pub async fn initialize(&mut self) -> Result<(), TransportError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": {"name": "kb-orchestrator", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {}
            }),
        )
        .await?;
        self.notify("notifications/initialized").await?;

        let tools = self.request("tools/list", json!({})).await?;
        let offered = tools
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .any(|tool| tool.get("name").and_then(Value::as_str) == Some(RUN_CODEX_TOOL))
            })
            .unwrap_or(false);
        if !offered {
            return Err(TransportError::Protocol(format!(
                "server does not offer {RUN_CODEX_TOOL}"
            )));
        }
        Ok(())
    }

    pub async fn run_codex(&mut self, args: &RunCodexArgs) -> Result<String, TransportError> {
        let arguments =
            serde_json::to_value(args).map_err(|err| TransportError::Protocol(err.to_string()))?;
        let result = self
            .request(
                "tools/call",
                json!({"name": RUN_CODEX_TOOL, "arguments": arguments}),
            )
            .await?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = extract_tool_text(&result);
            return Err(TransportError::ToolFailed(if message.is_empty() {
                "sandbox server reported an error".to_string()
            } else {
                message
            }));
        }
        Ok(extract_tool_text(&result))
    }

    async fn notify(&mut self, method: &str) -> Result<(), TransportError> {
        self.write_json(&json!({"jsonrpc": JSONRPC_VERSION, "method": method}))
            .await
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = Value::String(Uuid::new_v4().to_string());
        self.write_json(&json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;
        self.read_response_matching(&id).await
    }

    async fn write_json(&mut self, value: &Value) -> Result<(), TransportError> {
        let serialized =
            serde_json::to_string(value).map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.writer.write_all(serialized.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_response_matching(&mut self, expected_id: &Value) -> Result<Value, TransportError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(TransportError::Closed);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed: RawRpcResponse = match serde_json::from_str(trimmed) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("ignoring non JSON-RPC line from sandbox server: {}", err);
                    continue;
                }
            };

            if parsed.id != *expected_id {
                debug!(expected = ?expected_id, got = ?parsed.id, "skipping response with mismatched id");
                continue;
            }

            if let Some(error) = parsed.error {
                return Err(TransportError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }
            return parsed
                .result
                .ok_or_else(|| TransportError::Protocol("response has neither result nor error".into()));
        }
    }
}

/// Prefers a non-blank `structuredContent.text`, else joins the non-blank text
/// content blocks.
pub fn extract_tool_text(result: &Value) -> String {
    if let Some(text) = result
        .pointer("/structuredContent/text")
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
    {
        return text.trim().to_string();
    }

    result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .filter(|text| !text.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    #[test]
    fn structured_text_is_preferred() {
        let result = json!({
            "content": [{"type": "text", "text": "from blocks"}],
            "structuredContent": {"text": " from structure "}
        });
        assert_eq!(extract_tool_text(&result), "from structure");
    }

    #[test]
    fn blank_and_non_text_blocks_are_ignored() {
        let result = json!({
            "content": [
                {"type": "text", "text": "one"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "   "},
                {"type": "text", "text": "two"}
            ],
            "structuredContent": {"text": ""}
        });
        assert_eq!(extract_tool_text(&result), "one\ntwo");
    }

    /// Minimal scripted server: answers each request in order with `replies`,
    /// echoing the request id.
    async fn fake_server(stream: tokio::io::DuplexStream, replies: Vec<Value>) {
        let (read, mut write) = split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut replies = replies.into_iter();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = request.get("id").cloned() else {
                continue;
            };
            let Some(mut reply) = replies.next() else {
                break;
            };
            // a stray line the client must skip
            write.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"other\",\"result\":{}}\n").await.unwrap();
            reply["jsonrpc"] = json!("2.0");
            reply["id"] = id;
            write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
        }
    }

    fn args() -> RunCodexArgs {
        RunCodexArgs {
            prompt: "p".into(),
            api_key: "k".into(),
            model: "m".into(),
            ..RunCodexArgs::default()
        }
    }

    #[tokio::test]
    async fn session_runs_handshake_and_tool_call() {
        let (client, server) = duplex(4096);
        let handle = tokio::spawn(fake_server(
            server,
            vec![
                json!({"result": {"protocolVersion": PROTOCOL_VERSION}}),
                json!({"result": {"tools": [{"name": "run_codex"}]}}),
                json!({"result": {"content": [{"type": "text", "text": "Done\nSTATUS: SUCCESS"}]}}),
            ],
        ));

        let (read, write) = split(client);
        let mut session = McpSession::new(read, write);
        session.initialize().await.unwrap();
        let text = session.run_codex(&args()).await.unwrap();
        assert_eq!(text, "Done\nSTATUS: SUCCESS");
        drop(session);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn error_result_becomes_tool_failure() {
        let (client, server) = duplex(4096);
        tokio::spawn(fake_server(
            server,
            vec![json!({"result": {"isError": true, "content": [{"type": "text", "text": "API key is not configured."}]}})],
        ));

        let (read, write) = split(client);
        let mut session = McpSession::new(read, write);
        let err = session.run_codex(&args()).await.unwrap_err();
        assert!(matches!(err, TransportError::ToolFailed(ref msg) if msg == "API key is not configured."));
    }

    #[tokio::test]
    async fn rpc_error_and_closed_channel_are_failures() {
        let (client, server) = duplex(4096);
        tokio::spawn(fake_server(
            server,
            vec![json!({"error": {"code": -32601, "message": "Tool not found"}})],
        ));

        let (read, write) = split(client);
        let mut session = McpSession::new(read, write);
        let err = session.run_codex(&args()).await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc { code: -32601, .. }));

        let err = session.run_codex(&args()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed | TransportError::Io(_)));
    }
}
