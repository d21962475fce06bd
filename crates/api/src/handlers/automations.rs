//! Handlers for storing and reading a task's automation script.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use evidence_core::script_key::ScriptSlot;
use evidence_core::types::{OrganizationId, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Query parameters selecting the script slot.
#[derive(Debug, Deserialize)]
pub struct SlotQuery {
    /// `published` (default) or `draft`.
    pub slot: Option<ScriptSlot>,
}

/// Request body for saving a script.
#[derive(Debug, Deserialize)]
pub struct PutAutomationRequest {
    pub source: String,
    #[serde(default)]
    pub slot: ScriptSlot,
}

/// A stored script and its key.
#[derive(Debug, Serialize)]
pub struct AutomationScript {
    pub key: String,
    pub source: String,
}

pub(crate) fn parse_task_path(org_id: String, task_id: String) -> AppResult<(OrganizationId, TaskId)> {
    Ok((OrganizationId::parse(org_id)?, TaskId::parse(task_id)?))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// PUT /organizations/{org_id}/tasks/{task_id}/automation
///
/// Replace the task's script. The next dispatch runs the new source.
pub async fn put_automation(
    State(state): State<AppState>,
    Path((org_id, task_id)): Path<(String, String)>,
    Json(input): Json<PutAutomationRequest>,
) -> AppResult<StatusCode> {
    let (org, task) = parse_task_path(org_id, task_id)?;

    if input.source.trim().is_empty() {
        return Err(AppError::BadRequest("source must not be empty".to_string()));
    }
    let max = state.config.limits.max_source_bytes;
    if input.source.len() > max {
        return Err(AppError::BadRequest(format!(
            "source exceeds {max} bytes"
        )));
    }

    state.scripts.save(&org, &task, input.slot, &input.source).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /organizations/{org_id}/tasks/{task_id}/automation
pub async fn get_automation(
    State(state): State<AppState>,
    Path((org_id, task_id)): Path<(String, String)>,
    Query(query): Query<SlotQuery>,
) -> AppResult<Json<DataResponse<AutomationScript>>> {
    let (org, task) = parse_task_path(org_id, task_id)?;
    let script = state
        .scripts
        .resolve(&org, &task, query.slot.unwrap_or_default())
        .await?;

    Ok(Json(DataResponse {
        data: AutomationScript {
            key: script.key.to_string(),
            source: script.source,
        },
    }))
}
