//! The execution result contract shared by the engine, the sandbox runner,
//! and the run tracker.
//!
//! An [`ExecutionReport`] is what every backend produces. It is also the
//! exact JSON document the runner writes to its output file, so it must stay
//! stable across process boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{OrganizationId, RunId, TaskId};

/// Classification of a failed execution.
///
/// `StoreUnavailable` and `SandboxUnavailable` describe infrastructure
/// faults and are the only retryable kinds. Everything else is a property
/// of the tenant's script and is reported as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The script store could not be reached.
    StoreUnavailable,
    /// No script is stored under the requested key.
    NotFound,
    /// The module exported neither a function nor `{ handler }`.
    InvalidExport,
    /// The source failed to parse.
    CompileError,
    /// The script threw or its promise rejected.
    ScriptError,
    /// The wall-clock budget or an execution limit was exhausted.
    TimedOut,
    /// A sandbox could not be provisioned or the runner could not start.
    SandboxUnavailable,
    /// The run was canceled before it finished.
    Canceled,
}

impl ErrorKind {
    /// Whether the tracker may retry the dispatch.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::SandboxUnavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StoreUnavailable => "StoreUnavailable",
            Self::NotFound => "NotFound",
            Self::InvalidExport => "InvalidExport",
            Self::CompileError => "CompileError",
            Self::ScriptError => "ScriptError",
            Self::TimedOut => "TimedOut",
            Self::SandboxUnavailable => "SandboxUnavailable",
            Self::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Second argument handed to the script entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub organization_id: OrganizationId,
    pub task_id: TaskId,
    pub run_id: RunId,
}

/// Outcome of one script execution.
///
/// Serialized as `{ ok: true, result, logs }` or
/// `{ ok: false, errorKind, message, logs }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ExecutionReport {
    pub fn success(result: Value, logs: Vec<String>) -> Self {
        Self {
            ok: true,
            result,
            error_kind: None,
            message: None,
            logs,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error_kind: Some(kind),
            message: Some(message.into()),
            logs,
        }
    }

    /// The failure kind, or `None` for a successful report.
    ///
    /// A report that claims failure without a kind is treated as a script
    /// error so malformed runner output never reads as success.
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        if self.ok {
            None
        } else {
            Some(self.error_kind.unwrap_or(ErrorKind::ScriptError))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
