//! Route definitions for automation script storage.

use axum::routing::get;
use axum::Router;

use crate::handlers::automations;
use crate::state::AppState;

/// Routes mounted at `/organizations`.
///
/// ```text
/// GET    /{org_id}/tasks/{task_id}/automation   -> get_automation
/// PUT    /{org_id}/tasks/{task_id}/automation   -> put_automation
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/{org_id}/tasks/{task_id}/automation",
        get(automations::get_automation).put(automations::put_automation),
    )
}
