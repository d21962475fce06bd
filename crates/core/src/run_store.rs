//! Persistence seam for run records.
//!
//! [`RunStore`] is implemented in memory here and on PostgreSQL in
//! `evidence-db`. Both funnel updates through [`RunRecord::apply`] so the
//! state machine is identical regardless of storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::run::{RunRecord, RunTransition};
use crate::types::{RunId, Timestamp};

/// Storage for run records keyed by [`RunId`].
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id already exists.
    async fn insert(&self, record: RunRecord) -> Result<(), CoreError>;

    /// Fetch a record by id.
    async fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>, CoreError>;

    /// Atomically apply `transition` and return the updated record.
    async fn transition(
        &self,
        run_id: &RunId,
        transition: RunTransition,
    ) -> Result<RunRecord, CoreError>;

    /// Delete terminal records that finished before `cutoff`.
    async fn purge_finished_before(&self, cutoff: Timestamp) -> Result<u64, CoreError>;
}

/// Process-local [`RunStore`] used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    records: RwLock<HashMap<RunId, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, record: RunRecord) -> Result<(), CoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.run_id) {
            return Err(CoreError::Conflict(format!(
                "run {} already exists",
                record.run_id
            )));
        }
        records.insert(record.run_id.clone(), record);
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>, CoreError> {
        Ok(self.records.read().await.get(run_id).cloned())
    }

    async fn transition(
        &self,
        run_id: &RunId,
        transition: RunTransition,
    ) -> Result<RunRecord, CoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(run_id).ok_or_else(|| CoreError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })?;
        record.apply(transition)?;
        Ok(record.clone())
    }

    async fn purge_finished_before(&self, cutoff: Timestamp) -> Result<u64, CoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            !(record.status.is_terminal() && record.finished_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - records.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::execution::ExecutionReport;
    use crate::request::ExecutionRequest;
    use crate::run::RunStatus;
    use crate::types::{OrganizationId, TaskId};

    fn pending() -> RunRecord {
        let request = ExecutionRequest::new(
            OrganizationId::parse("acme").expect("org"),
            TaskId::parse("t1").expect("task"),
        );
        RunRecord::pending(RunId::generate(), &request)
    }

    #[tokio::test]
    async fn insert_get_and_transition() {
        let store = MemoryRunStore::new();
        let record = pending();
        let id = record.run_id.clone();
        store.insert(record).await.expect("insert");

        let updated = store
            .transition(&id, RunTransition::Started)
            .await
            .expect("start");
        assert_eq!(updated.status, RunStatus::Executing);

        let fetched = store.get(&id).await.expect("get").expect("present");
        assert_eq!(fetched, updated);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = MemoryRunStore::new();
        let record = pending();
        store.insert(record.clone()).await.expect("insert");
        assert_matches!(store.insert(record).await, Err(CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let store = MemoryRunStore::new();
        assert!(store.get(&RunId::generate()).await.expect("get").is_none());
        assert_matches!(
            store
                .transition(&RunId::generate(), RunTransition::Started)
                .await,
            Err(CoreError::NotFound { entity: "run", .. })
        );
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_runs() {
        let store = MemoryRunStore::new();

        let finished = pending();
        let finished_id = finished.run_id.clone();
        store.insert(finished).await.expect("insert");
        store
            .transition(&finished_id, RunTransition::Started)
            .await
            .expect("start");
        store
            .transition(
                &finished_id,
                RunTransition::Finished(ExecutionReport::success(json!(1), vec![])),
            )
            .await
            .expect("finish");

        let running = pending();
        let running_id = running.run_id.clone();
        store.insert(running).await.expect("insert");

        let purged = store
            .purge_finished_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .expect("purge");
        assert_eq!(purged, 1);
        assert!(store.get(&finished_id).await.expect("get").is_none());
        assert!(store.get(&running_id).await.expect("get").is_some());
    }
}
