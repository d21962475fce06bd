//! Route definitions for automation runs.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::runs;
use crate::state::AppState;

/// Routes mounted at `/organizations`.
///
/// ```text
/// POST   /{org_id}/tasks/{task_id}/runs         -> dispatch_run
/// GET    /{org_id}/runs/{run_id}                -> get_run
/// POST   /{org_id}/runs/{run_id}/cancel         -> cancel_run
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{org_id}/tasks/{task_id}/runs", post(runs::dispatch_run))
        .route("/{org_id}/runs/{run_id}", get(runs::get_run))
        .route("/{org_id}/runs/{run_id}/cancel", post(runs::cancel_run))
}
