//! Execution requests accepted by the run tracker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::script_key::ScriptSlot;
use crate::types::{OrganizationId, SandboxId, TaskId};

/// A request to run one task's automation script.
///
/// Without a `sandbox_id` the script runs once in a throwaway environment.
/// With one, the named interactive sandbox is reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub organization_id: OrganizationId,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub slot: ScriptSlot,
}

impl ExecutionRequest {
    pub fn new(organization_id: OrganizationId, task_id: TaskId) -> Self {
        Self {
            organization_id,
            task_id,
            sandbox_id: None,
            event: Value::Null,
            slot: ScriptSlot::Published,
        }
    }

    pub fn with_event(mut self, event: Value) -> Self {
        self.event = event;
        self
    }

    pub fn with_sandbox(mut self, sandbox_id: SandboxId) -> Self {
        self.sandbox_id = Some(sandbox_id);
        self
    }

    pub fn with_slot(mut self, slot: ScriptSlot) -> Self {
        self.slot = slot;
        self
    }
}
