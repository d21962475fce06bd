//! Periodic cleanup of finished run records.
//!
//! Deletes terminal runs that finished longer ago than the retention
//! window. Once purged, a run's status reads as missing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use evidence_core::error::CoreError;
use evidence_core::run_store::RunStore;
use tokio_util::sync::CancellationToken;

/// How often the cleanup job runs.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600); // 1 hour

/// Delete terminal runs that finished more than `retention` ago.
pub async fn purge_once(store: &dyn RunStore, retention: Duration) -> Result<u64, CoreError> {
    let age = chrono::Duration::from_std(retention)
        .map_err(|e| CoreError::Validation(format!("retention out of range: {e}")))?;
    store.purge_finished_before(Utc::now() - age).await
}

/// Run the retention loop every `interval` until `cancel` is triggered.
pub async fn run(
    store: Arc<dyn RunStore>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = interval.as_secs(),
        "Run retention job started"
    );

    let mut interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Run retention job stopping");
                break;
            }
            _ = interval.tick() => {
                match purge_once(store.as_ref(), retention).await {
                    Ok(deleted) => {
                        if deleted > 0 {
                            tracing::info!(deleted, "Run retention: purged finished runs");
                        } else {
                            tracing::debug!("Run retention: no runs to purge");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Run retention: cleanup failed");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use evidence_core::execution::ExecutionReport;
    use evidence_core::request::ExecutionRequest;
    use evidence_core::run::{RunRecord, RunTransition};
    use evidence_core::run_store::MemoryRunStore;
    use evidence_core::types::{OrganizationId, RunId, TaskId};
    use serde_json::json;

    use super::*;

    async fn finished_run(store: &MemoryRunStore) -> RunId {
        let request = ExecutionRequest::new(
            OrganizationId::parse("acme").expect("org"),
            TaskId::parse("t1").expect("task"),
        );
        let run_id = RunId::generate();
        store
            .insert(RunRecord::pending(run_id.clone(), &request))
            .await
            .expect("insert");
        store
            .transition(&run_id, RunTransition::Started)
            .await
            .expect("start");
        store
            .transition(
                &run_id,
                RunTransition::Finished(ExecutionReport::success(json!(1), vec![])),
            )
            .await
            .expect("finish");
        run_id
    }

    #[tokio::test]
    async fn recent_runs_survive_and_old_runs_are_purged() {
        let store = MemoryRunStore::new();
        let run_id = finished_run(&store).await;

        let deleted = purge_once(&store, Duration::from_secs(3600))
            .await
            .expect("purge");
        assert_eq!(deleted, 0);
        assert!(store.get(&run_id).await.expect("get").is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let deleted = purge_once(&store, Duration::ZERO).await.expect("purge");
        assert_eq!(deleted, 1);
        assert!(store.get(&run_id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            store,
            Duration::from_secs(60),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop stopped")
            .expect("task ok");
    }
}
