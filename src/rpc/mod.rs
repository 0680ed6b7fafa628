//! RPC stdio protocol (component J).
//!
//! Newline-delimited JSON-RPC-2.0 over the supervisor's own stdin/stdout.
//! Each line on stdin is one request; each line written to stdout is one
//! response. `initialize`/`tools/list` mirror the MCP-style handshake the
//! orchestrating client expects before issuing tool calls; the five
//! `axiom_*` methods map 1:1 onto the Request Router's operations.
//!
//! The blocking stdin read runs on its own OS thread — the same
//! discipline the PTY executor uses for its reader — so it never
//! occupies an async worker thread with a blocking syscall. All parsed
//! requests are dispatched onto the tokio runtime and their responses
//! funnel through a single `mpsc` channel into one stdout-writer task,
//! so two concurrent handlers (e.g. a slow `output` and a fast `status`)
//! never interleave partial JSON lines on the shared stdout resource.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::error::TaskError;
use crate::core::router::{InterruptOpts, OutputOpts, Router, SpawnOpts};

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    #[serde(default = "default_jsonrpc_version")]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn default_jsonrpc_version() -> String {
    "2.0".to_string()
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
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
}

fn invalid_params(e: serde_json::Error) -> JsonRpcError {
    JsonRpcError {
        code: -32602,
        message: format!("invalid params: {e}"),
    }
}

fn internal_error(msg: impl Into<String>) -> JsonRpcError {
    JsonRpcError {
        code: -32603,
        message: msg.into(),
    }
}

fn task_error(e: TaskError) -> JsonRpcError {
    JsonRpcError {
        code: -32000,
        message: format!("{:?}: {}", e.code, e.message),
    }
}

/// Owns nothing beyond the shared [`Router`]; the stdio framing itself
/// is stateless across requests.
pub struct RpcServer {
    router: Arc<Router>,
}

impl RpcServer {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Runs the stdio loop until stdin reaches EOF. Resolves once the
    /// reader thread has drained EOF and joined.
    pub async fn run(self) -> io::Result<()> {
        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut stdout = io::stdout();
            while let Some(line) = out_rx.recv().await {
                if writeln!(stdout, "{line}").is_err() || stdout.flush().is_err() {
                    break;
                }
            }
        });

        let router = self.router;
        let rt_handle = tokio::runtime::Handle::current();
        let (eof_tx, eof_rx) = tokio::sync::oneshot::channel();

        std::thread::Builder::new()
            .name("rpc-stdin".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                for line in stdin.lock().lines() {
                    let line = match line {
                        Ok(l) => l,
                        Err(e) => {
                            log::error!("stdin read error: {e}");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let request: JsonRpcRequest = match serde_json::from_str(&line) {
                        Ok(req) => req,
                        Err(e) => {
                            log::warn!("malformed JSON-RPC line, skipping: {e}");
                            continue;
                        }
                    };
                    let router = router.clone();
                    let out_tx = out_tx.clone();
                    rt_handle.spawn(async move {
                        if let Some(response) = handle_request(&router, request).await {
                            if let Ok(text) = serde_json::to_string(&response) {
                                let _ = out_tx.send(text);
                            }
                        }
                    });
                }
                let _ = eof_tx.send(());
            })?;

        let _ = eof_rx.await;
        Ok(())
    }
}

async fn handle_request(router: &Router, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    // A request with no `id` is a notification: dispatch has no
    // observable effect on this router (axiomd has no session handshake
    // beyond initialize/tools/list), so it is acknowledged by silence,
    // matching JSON-RPC 2.0 notification semantics.
    let id = request.id.clone()?;

    let outcome: Result<Value, JsonRpcError> = match request.method.as_str() {
        "initialize" => Ok(initialize_result()),
        "tools/list" => Ok(tools_list_result()),
        "axiom_spawn" => dispatch_spawn(router, request.params).await,
        "axiom_send" => dispatch_send(router, request.params).await,
        "axiom_status" => dispatch_status(router, request.params),
        "axiom_output" => dispatch_output(router, request.params),
        "axiom_interrupt" => dispatch_interrupt(router, request.params).await,
        other => Err(JsonRpcError {
            code: -32601,
            message: format!("method not found: {other}"),
        }),
    };

    let (result, error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(e)),
    };

    Some(JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result,
        error,
    })
}

#[derive(Debug, Deserialize)]
struct SpawnParams {
    prompt: String,
    #[serde(default)]
    opts: SpawnOpts,
}

async fn dispatch_spawn(router: &Router, params: Value) -> Result<Value, JsonRpcError> {
    let parsed: SpawnParams = serde_json::from_value(params).map_err(invalid_params)?;
    let result = router.spawn(parsed.prompt, parsed.opts).map_err(task_error)?;
    serde_json::to_value(result).map_err(|e| internal_error(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct SendParams {
    task_id: String,
    message: String,
}

async fn dispatch_send(router: &Router, params: Value) -> Result<Value, JsonRpcError> {
    let parsed: SendParams = serde_json::from_value(params).map_err(invalid_params)?;
    router
        .send(&parsed.task_id, &parsed.message)
        .await
        .map_err(task_error)?;
    Ok(json!({}))
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    #[serde(default)]
    task_id: Option<String>,
}

fn dispatch_status(router: &Router, params: Value) -> Result<Value, JsonRpcError> {
    let parsed: StatusParams = if params.is_null() {
        StatusParams::default()
    } else {
        serde_json::from_value(params).map_err(invalid_params)?
    };
    let result = router
        .status(parsed.task_id.as_deref())
        .map_err(task_error)?;
    serde_json::to_value(result).map_err(|e| internal_error(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct OutputParams {
    task_id: String,
    #[serde(default)]
    tail: Option<usize>,
}

fn dispatch_output(router: &Router, params: Value) -> Result<Value, JsonRpcError> {
    let parsed: OutputParams = serde_json::from_value(params).map_err(invalid_params)?;
    let result = router
        .output(&parsed.task_id, OutputOpts { tail: parsed.tail })
        .map_err(task_error)?;
    serde_json::to_value(result).map_err(|e| internal_error(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct InterruptParams {
    task_id: String,
    #[serde(default)]
    force: bool,
}

async fn dispatch_interrupt(router: &Router, params: Value) -> Result<Value, JsonRpcError> {
    let parsed: InterruptParams = serde_json::from_value(params).map_err(invalid_params)?;
    router
        .interrupt(&parsed.task_id, InterruptOpts { force: parsed.force })
        .await
        .map_err(task_error)?;
    Ok(json!({}))
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": "axiom-supervisor",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

fn tools_list_result() -> Value {
    json!({
        "tools": [
            {
                "name": "axiom_spawn",
                "description": "Launch a supervised task running the configured child CLI with the given prompt. Returns as soon as the child is running, without waiting for it to finish.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "prompt": { "type": "string" },
                        "opts": {
                            "type": "object",
                            "properties": {
                                "verbose": { "type": "boolean" },
                                "tags": { "type": "object", "additionalProperties": { "type": "string" } }
                            }
                        }
                    },
                    "required": ["prompt"]
                }
            },
            {
                "name": "axiom_send",
                "description": "Write a message to a running task's stdin.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                        "message": { "type": "string" }
                    },
                    "required": ["task_id", "message"]
                }
            },
            {
                "name": "axiom_status",
                "description": "Fetch the current record for one task, or every task if task_id is omitted.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "task_id": { "type": "string" } }
                }
            },
            {
                "name": "axiom_output",
                "description": "Fetch a task's accumulated output, optionally only the last `tail` bytes.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                        "tail": { "type": "integer" }
                    },
                    "required": ["task_id"]
                }
            },
            {
                "name": "axiom_interrupt",
                "description": "Send SIGINT (or SIGINT then SIGKILL if force) to a running task's child process.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                        "force": { "type": "boolean" }
                    },
                    "required": ["task_id"]
                }
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn make_request(value: Value) -> JsonRpcRequest {
        serde_json::from_value(value).expect("invalid test request JSON")
    }

    fn test_router() -> Router {
        let mut config = Config::default();
        config.child.command = "/bin/sh".to_string();
        config.child.args = vec!["-c".to_string(), "true".to_string()];
        Router::new(Arc::new(config))
    }

    #[tokio::test]
    async fn notification_without_id_returns_none() {
        let router = test_router();
        let request = make_request(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }));
        assert!(handle_request(&router, request).await.is_none());
    }

    #[tokio::test]
    async fn initialize_returns_server_info() {
        let router = test_router();
        let request = make_request(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}));
        let response = handle_request(&router, request).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "axiom-supervisor");
    }

    #[tokio::test]
    async fn tools_list_advertises_five_tools() {
        let router = test_router();
        let request = make_request(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}));
        let response = handle_request(&router, request).await.unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 5);
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let router = test_router();
        let request = make_request(json!({"jsonrpc": "2.0", "id": 3, "method": "nope"}));
        let response = handle_request(&router, request).await.unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn axiom_spawn_round_trips_through_json() {
        let router = test_router();
        let request = make_request(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "axiom_spawn",
            "params": { "prompt": "hello" }
        }));
        let response = handle_request(&router, request).await.unwrap();
        let result = response.result.expect("spawn should succeed");
        assert_eq!(result["state"], "running");
        assert!(result["task_id"].is_string());
    }

    #[tokio::test]
    async fn axiom_send_to_missing_task_is_rpc_error() {
        let router = test_router();
        let request = make_request(json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "axiom_send",
            "params": { "task_id": "does-not-exist", "message": "hi" }
        }));
        let response = handle_request(&router, request).await.unwrap();
        let error = response.error.expect("send to missing task must error");
        assert_eq!(error.code, -32000);
        assert!(error.message.contains("NotFound"));
    }

    #[tokio::test]
    async fn axiom_status_with_no_params_lists_all() {
        let router = test_router();
        router.spawn("a".to_string(), SpawnOpts::default()).unwrap();
        let request = make_request(json!({"jsonrpc": "2.0", "id": 6, "method": "axiom_status"}));
        let response = handle_request(&router, request).await.unwrap();
        let result = response.result.unwrap();
        assert!(result.as_array().unwrap().len() >= 1);
    }
}
