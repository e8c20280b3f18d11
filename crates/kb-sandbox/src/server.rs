use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use kb_mcp_core::{McpError, McpTool, ToolDescriptor, JSONRPC_VERSION, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

/// Static table of tools, kept in registration order for `tools/list`.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn McpTool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn McpTool>>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();

        for tool in tools {
            let name = tool.name().to_string();
            if map.insert(name.clone(), tool).is_none() {
                order.push(name);
            }
        }

        Self { tools: map, order }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn McpTool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.descriptor())
            .collect()
    }
}

pub struct McpServer {
    registry: ToolRegistry,
}

impl McpServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn serve_stdio(&self) -> Result<()> {
        let reader = BufReader::new(tokio::io::stdin());
        let writer = tokio::io::stdout();
        self.serve(reader, writer).await
    }

    /// Line-delimited JSON-RPC loop; returns when the peer closes its end.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("sandbox server listening");
        let mut line = String::new();

        loop {
            line.clear();
            let read = match reader.read_line(&mut line).await {
                Ok(read) => read,
                Err(err) => {
                    error!("read error: {}", err);
                    break;
                }
            };
            if read == 0 {
                debug!("client disconnected (EOF)");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Value>(trimmed) {
                Ok(request) => match self.handle_jsonrpc(request).await {
                    Ok(response) => response,
                    Err(err) => {
                        error!("handle_jsonrpc failed: {}", err);
                        Some(json!({
                            "jsonrpc": JSONRPC_VERSION,
                            "id": Value::Null,
                            "error": {"code": -32603, "message": "Internal error"}
                        }))
                    }
                },
                Err(err) => {
                    warn!("JSON parse error: {}", err);
                    Some(json!({
                        "jsonrpc": JSONRPC_VERSION,
                        "id": Value::Null,
                        "error": {"code": -32700, "message": "Parse error"}
                    }))
                }
            };

            if let Some(response) = response {
                let mut payload = serde_json::to_string(&response)?;
                payload.push('\n');
                writer.write_all(payload.as_bytes()).await?;
                writer.flush().await?;
            }
        }

        Ok(())
    }

    pub async fn handle_jsonrpc(&self, request: Value) -> Result<Option<Value>> {
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Missing method field"))?;

        if method.starts_with("notifications/") {
            debug!("notification '{}' ignored", method);
            return Ok(None);
        }

        debug!("handling JSON-RPC method '{}'", method);
        let request_struct: JsonRpcRequest = serde_json::from_value(request)?;
        let response = handle_request(request_struct, &self.registry).await;
        Ok(Some(serde_json::to_value(&response)?))
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, error: McpError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code: error.code(),
                message: error.message(),
                data: error.data(),
            }),
        }
    }
}

async fn handle_request(request: JsonRpcRequest, registry: &ToolRegistry) -> JsonRpcResponse {
    let JsonRpcRequest {
        jsonrpc,
        id,
        method,
        params,
    } = request;
    let id = id.unwrap_or(Value::Null);

    if jsonrpc != JSONRPC_VERSION {
        return JsonRpcResponse::error(
            id,
            McpError::InvalidRequest(format!("Unsupported JSON-RPC version: {jsonrpc}")),
        );
    }

    match method.as_str() {
        "initialize" => JsonRpcResponse::ok(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": false }
                },
                "serverInfo": {
                    "name": "kb-sandbox",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        ),
        "tools/list" => JsonRpcResponse::ok(id, json!({ "tools": registry.descriptors() })),
        "tools/call" => handle_tools_call(id, params, registry).await,
        "ping" => JsonRpcResponse::ok(id, json!({})),
        _ => JsonRpcResponse::error(
            id,
            McpError::rpc(-32601, format!("Unknown method: {method}"), None),
        ),
    }
}

async fn handle_tools_call(
    id: Value,
    params: Option<Value>,
    registry: &ToolRegistry,
) -> JsonRpcResponse {
    let params = match params {
        Some(Value::Object(map)) => map,
        _ => {
            return JsonRpcResponse::error(
                id,
                McpError::InvalidRequest("Missing params object for tools/call".into()),
            );
        }
    };

    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::error(
            id,
            McpError::InvalidRequest("Missing 'name' in params".into()),
        );
    };

    let Some(tool) = registry.get(name) else {
        return JsonRpcResponse::error(id, McpError::ToolNotFound(name.to_string()));
    };

    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match tool.execute(arguments).await {
        Ok(result) => JsonRpcResponse::ok(id, result),
        // tool failures are results, not protocol errors
        Err(err) => {
            warn!(tool = name, "tool call failed: {}", err);
            let mut result = json!({
                "isError": true,
                "content": [{"type": "text", "text": err.message()}],
            });
            if let Some(data) = err.data() {
                result["structuredContent"] = data;
            }
            JsonRpcResponse::ok(id, result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kb_mcp_core::{text_result, McpResult};

    struct Echo;

    #[async_trait]
    impl McpTool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echo"
        }

        async fn execute(&self, params: Value) -> McpResult<Value> {
            match params.get("text").and_then(Value::as_str) {
                Some(text) => Ok(text_result(text)),
                None => Err(McpError::rpc(-32602, "text required", None)),
            }
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
    }

    fn server() -> McpServer {
        McpServer::new(ToolRegistry::new(vec![Arc::new(Echo)]))
    }

    #[tokio::test]
    async fn tools_call_dispatches_to_registered_tool() {
        let response = server()
            .handle_jsonrpc(json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "echo", "arguments": {"text": "hi"}}
            }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn tool_failure_is_an_error_result() {
        let response = server()
            .handle_jsonrpc(json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "echo", "arguments": {}}
            }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["result"]["isError"], true);
        assert_eq!(response["result"]["content"][0]["text"], "text required");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_protocol_error() {
        let response = server()
            .handle_jsonrpc(json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "nope"}
            }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let response = server()
            .handle_jsonrpc(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn serve_answers_line_by_line() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            "not json\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n"
        );
        let mut output = Vec::new();
        server()
            .serve(BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["result"]["serverInfo"]["name"], "kb-sandbox");
        assert_eq!(lines[1]["error"]["code"], -32700);
        assert_eq!(lines[2]["result"]["tools"][0]["name"], "echo");
    }
}
