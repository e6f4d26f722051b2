// Worker IPC frames
//
// Decision: Every frame is one JSON object tagged by `type`
// Decision: Host -> worker: init, request, shutdown
// Decision: Worker -> host: ready, startup_failed, heartbeat, response
//
// Session shape:
//
//   host                         worker
//    | --- init --------------->  |  (credentials, heartbeat interval)
//    | <-------------- ready ---  |  (or startup_failed)
//    | --- request ------------>  |
//    | <----------- heartbeat --  |  (periodic)
//    | <------------ response --  |
//    | --- shutdown ----------->  |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::account::{AccountSummary, Credentials};
use crate::duration_millis;
use crate::task::{MethodName, Task};

/// Frames written by the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Init(WorkerInit),
    Request(WorkerRequest),
    Shutdown,
}

/// Frames written by a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    Ready {
        process_id: Uuid,
        pid: u32,
    },
    StartupFailed {
        error: String,
    },
    Heartbeat {
        tasks_completed: u64,
        at: DateTime<Utc>,
    },
    Response(WorkerResponse),
}

/// First frame of every session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInit {
    pub process_id: Uuid,
    pub account: AccountSummary,
    pub credentials: Credentials,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
}

/// A task as shipped to the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: Uuid,
    pub method: MethodName,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl From<&Task> for WorkerRequest {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            method: task.method.clone(),
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            timeout: task.timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Classification of handler failures crossing the process boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArguments,
    UnknownMethod,
    Rejected,
    Timeout,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::UnknownMethod => "unknown_method",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Result of one request, tagged ok or error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub task_id: Uuid,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl WorkerResponse {
    pub fn ok(task_id: Uuid, payload: Value) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Ok,
            payload: Some(payload),
            error_kind: None,
            error_message: None,
        }
    }

    pub fn error(task_id: Uuid, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Error,
            payload: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Error text in `kind: message` form, if this is an error response
    pub fn describe_error(&self) -> Option<String> {
        if self.is_ok() {
            return None;
        }
        let message = self.error_message.as_deref().unwrap_or("unknown error");
        Some(match self.error_kind {
            Some(kind) => format!("{}: {}", kind, message),
            None => message.to_string(),
        })
    }
}
