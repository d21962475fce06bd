pub mod automations;
pub mod health;
pub mod runs;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /organizations/{org_id}/tasks/{task_id}/automation   get, put script
/// /organizations/{org_id}/tasks/{task_id}/runs         dispatch run (POST)
/// /organizations/{org_id}/runs/{run_id}                run status (GET)
/// /organizations/{org_id}/runs/{run_id}/cancel         cancel run (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest(
        "/organizations",
        automations::router().merge(runs::router()),
    )
}
