//! Handlers for dispatching automation runs and reading their status.
//!
//! Runs are scoped to the organization in the path: a run owned by another
//! organization is indistinguishable from one that does not exist.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use evidence_core::error::CoreError;
use evidence_core::request::ExecutionRequest;
use evidence_core::run::{RunError, RunRecord, RunStatus};
use evidence_core::script_key::ScriptSlot;
use evidence_core::types::{OrganizationId, RunId, SandboxId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppResult;
use crate::handlers::automations::parse_task_path;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Request body for dispatching a run.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRunRequest {
    /// Reuse this interactive sandbox instead of a throwaway environment.
    pub sandbox_id: Option<String>,
    /// First argument passed to the script's entry point.
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub slot: ScriptSlot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRunResponse {
    pub run_id: RunId,
}

/// Tenant-facing view of a run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,
    pub attempts: u32,
    pub logs: Vec<String>,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

impl From<RunRecord> for RunView {
    fn from(record: RunRecord) -> Self {
        Self {
            run_id: record.run_id,
            task_id: record.task_id,
            status: record.status,
            output: record.output,
            error: record.error,
            sandbox_id: record.sandbox_id,
            attempts: record.attempts,
            logs: record.logs,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }
}

fn run_not_found(run_id: &str) -> CoreError {
    CoreError::NotFound {
        entity: "run",
        id: run_id.to_string(),
    }
}

fn parse_run_path(org_id: String, run_id: &str) -> AppResult<(OrganizationId, RunId)> {
    let org = OrganizationId::parse(org_id)?;
    let run = RunId::parse(run_id).map_err(|_| run_not_found(run_id))?;
    Ok((org, run))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /organizations/{org_id}/tasks/{task_id}/runs
///
/// Record a `PENDING` run and start it in the background. Responds with
/// 202 and the run id; poll `GET /organizations/{org_id}/runs/{run_id}`
/// for the outcome.
pub async fn dispatch_run(
    State(state): State<AppState>,
    Path((org_id, task_id)): Path<(String, String)>,
    Json(input): Json<DispatchRunRequest>,
) -> AppResult<(StatusCode, Json<DataResponse<DispatchRunResponse>>)> {
    let (org, task) = parse_task_path(org_id, task_id)?;

    let mut request = ExecutionRequest::new(org, task)
        .with_event(input.event)
        .with_slot(input.slot);
    if let Some(sandbox_id) = input.sandbox_id {
        request = request.with_sandbox(SandboxId::parse(sandbox_id)?);
    }

    let run_id = state.tracker.dispatch(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: DispatchRunResponse { run_id },
        }),
    ))
}

/// GET /organizations/{org_id}/runs/{run_id}
///
/// Read-only. Terminal runs return the same view on every call until
/// retention purges them.
pub async fn get_run(
    State(state): State<AppState>,
    Path((org_id, run_id)): Path<(String, String)>,
) -> AppResult<Json<DataResponse<RunView>>> {
    let (org, run) = parse_run_path(org_id, &run_id)?;
    let record = state
        .tracker
        .status(&run, Some(&org))
        .await?
        .ok_or_else(|| run_not_found(&run_id))?;
    Ok(Json(DataResponse {
        data: record.into(),
    }))
}

/// POST /organizations/{org_id}/runs/{run_id}/cancel
///
/// Stop the run and record it as `CANCELED`. A run that already finished
/// is returned unchanged.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path((org_id, run_id)): Path<(String, String)>,
) -> AppResult<Json<DataResponse<RunView>>> {
    let (org, run) = parse_run_path(org_id, &run_id)?;
    let record = state
        .tracker
        .cancel(&run, &org)
        .await?
        .ok_or_else(|| run_not_found(&run_id))?;
    Ok(Json(DataResponse {
        data: record.into(),
    }))
}
