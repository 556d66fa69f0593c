//! `ralph mcp-server`: the completion side-channel.
//!
//! A minimal MCP server speaking newline-delimited JSON-RPC 2.0 over stdio. It
//! exposes one tool, `task_complete`. Which session and task the call completes
//! is fixed by the environment the engine spawned the agent with; tool
//! arguments cannot change it.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::io::signal::{TaskBinding, write_signal};

pub const TOOL_NAME: &str = "task_complete";

const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

pub struct McpServer {
    /// `Err` holds the reason the process is not bound to a task.
    binding: Result<TaskBinding, String>,
}

impl McpServer {
    pub fn new(binding: Result<TaskBinding, String>) -> Self {
        Self { binding }
    }

    pub fn from_env() -> Self {
        let binding = TaskBinding::from_env().map_err(|err| format!("{err:#}"));
        if let Err(reason) = &binding {
            warn!(%reason, "side-channel started without a task binding");
        }
        Self::new(binding)
    }

    /// Serve requests until `reader` reaches EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.context("read request")? {
            let Some(response) = self.handle_line(&line) else {
                continue;
            };
            let mut buf = serde_json::to_string(&response).context("serialize response")?;
            buf.push('\n');
            writer
                .write_all(buf.as_bytes())
                .await
                .context("write response")?;
            writer.flush().await.context("flush response")?;
        }
        debug!("side-channel input closed");
        Ok(())
    }

    /// Handle one input line; `None` for notifications and blank lines.
    pub fn handle_line(&self, line: &str) -> Option<Value> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let request: Value = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => return Some(error_response(Value::Null, PARSE_ERROR, &err.to_string())),
        };
        let id = request.get("id").cloned();
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return Some(error_response(
                id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "missing method",
            ));
        };
        // Notifications carry no id and never get a response.
        let id = id?;
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        debug!(method, "side-channel request");

        let outcome = match method {
            "initialize" => Ok(self.initialize(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": [tool_definition()] })),
            "tools/call" => self.call_tool(&params),
            other => Err((METHOD_NOT_FOUND, format!("method not found: {other}"))),
        };
        Some(match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => error_response(id, code, &message),
        })
    }

    fn initialize(&self, params: &Value) -> Value {
        let version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "ralph", "version": env!("CARGO_PKG_VERSION") },
        })
    }

    fn call_tool(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        if name != TOOL_NAME {
            return Err((INVALID_PARAMS, format!("unknown tool: {name}")));
        }
        let summary = params
            .get("arguments")
            .and_then(|args| args.get("summary"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let binding = match &self.binding {
            Ok(binding) => binding,
            Err(reason) => return Ok(tool_result(reason, true)),
        };
        match write_signal(binding, summary) {
            Ok(signal) => {
                info!(session_id = %signal.session_id, task_id = %signal.task_id, "task marked complete");
                Ok(tool_result(
                    &format!("Task {} marked complete.", signal.task_id),
                    false,
                ))
            }
            Err(err) => Ok(tool_result(
                &format!("could not record completion: {err:#}"),
                true,
            )),
        }
    }
}

fn tool_definition() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Call exactly once when the current task is fully implemented \
                        and its acceptance criteria are met.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "One or two sentences describing what was done."
                }
            }
        }
    })
}

fn tool_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}
