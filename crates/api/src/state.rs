use std::sync::Arc;

use evidence_store::ScriptStore;

use crate::config::ServerConfig;
use crate::scripting::RunTracker;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Script store client used by the automation endpoints.
    pub scripts: ScriptStore,
    /// Dispatches runs and answers status queries.
    pub tracker: RunTracker,
    /// Database pool, present when runs are persisted in PostgreSQL.
    pub pool: Option<evidence_db::DbPool>,
}
