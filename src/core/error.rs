use serde::Serialize;

/// Discriminant for client-facing errors, serialized alongside the message
/// so the orchestrator can branch on error kind rather than string-match
/// the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    NotFound,
    NotRunning,
    ChildGone,
    ExecFailure,
    InvalidRequest,
}

/// Error returned synchronously from a Request Router operation.
///
/// `spawn` surfaces `ExecFailure`; `send`/`interrupt` surface `NotFound`,
/// `NotRunning`, or `ChildGone`; `status`/`output` surface only `NotFound`.
/// Everything else in the supervisor (runtime I/O errors, backpressure
/// timeouts) is asynchronous and reaches the client only via `status` or
/// the notification bus, never as an `Err` from an RPC call.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{code:?}: {message}")]
pub struct TaskError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl TaskError {
    pub fn not_found(task_id: &str) -> Self {
        Self {
            code: RpcErrorCode::NotFound,
            message: format!("task {task_id} not found"),
        }
    }

    pub fn not_running(task_id: &str) -> Self {
        Self {
            code: RpcErrorCode::NotRunning,
            message: format!("task {task_id} is not running"),
        }
    }

    pub fn child_gone(task_id: &str) -> Self {
        Self {
            code: RpcErrorCode::ChildGone,
            message: format!("child process for task {task_id} has already exited"),
        }
    }

    pub fn exec_failure(msg: impl Into<String>) -> Self {
        Self {
            code: RpcErrorCode::ExecFailure,
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: RpcErrorCode::InvalidRequest,
            message: msg.into(),
        }
    }
}

/// Errors from resolving and validating startup configuration. Any
/// instance of this error causes the process to exit with code 2 before
/// the RPC loop starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("rule '{id}' has an invalid pattern: {source}")]
    InvalidRule {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate rule id '{0}'")]
    DuplicateRuleId(String),
    #[error("child.command is empty")]
    EmptyChildCommand,
    #[error("{field} must be non-zero")]
    ZeroField { field: &'static str },
}
