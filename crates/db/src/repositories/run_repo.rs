//! Repository for the `automation_runs` table.

use async_trait::async_trait;
use evidence_core::error::CoreError;
use evidence_core::run::{RunRecord, RunTransition};
use evidence_core::run_store::RunStore;
use evidence_core::types::{RunId, Timestamp};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

const RUN_COLUMNS: &str = "run_id, organization_id, task_id, status, record, created_at, finished_at";

fn db_error(e: sqlx::Error) -> CoreError {
    tracing::error!(error = %e, "Run store query failed");
    CoreError::Internal(format!("run store: {e}"))
}

/// [`RunStore`] on PostgreSQL.
///
/// Transitions lock the row (`SELECT ... FOR UPDATE`) and run through
/// [`RunRecord::apply`] so concurrent writers observe the same state
/// machine as the in-memory store.
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn insert(&self, record: RunRecord) -> Result<(), CoreError> {
        let query = format!(
            "INSERT INTO automation_runs ({RUN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        );
        sqlx::query(&query)
            .bind(record.run_id.as_str())
            .bind(record.organization_id.as_str())
            .bind(record.task_id.as_str())
            .bind(record.status.as_str())
            .bind(Json(&record))
            .bind(record.created_at)
            .bind(record.finished_at)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    CoreError::Conflict(format!("run {} already exists", record.run_id))
                }
                other => db_error(other),
            })?;
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>, CoreError> {
        let row = sqlx::query("SELECT record FROM automation_runs WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(|row| {
            row.try_get::<Json<RunRecord>, _>("record")
                .map(|Json(record)| record)
                .map_err(db_error)
        })
        .transpose()
    }

    async fn transition(
        &self,
        run_id: &RunId,
        transition: RunTransition,
    ) -> Result<RunRecord, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query("SELECT record FROM automation_runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
            .ok_or_else(|| CoreError::NotFound {
                entity: "run",
                id: run_id.to_string(),
            })?;
        let Json(mut record) = row
            .try_get::<Json<RunRecord>, _>("record")
            .map_err(db_error)?;

        record.apply(transition)?;

        sqlx::query(
            "UPDATE automation_runs SET status = $2, record = $3, finished_at = $4 WHERE run_id = $1",
        )
        .bind(run_id.as_str())
        .bind(record.status.as_str())
        .bind(Json(&record))
        .bind(record.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(record)
    }

    async fn purge_finished_before(&self, cutoff: Timestamp) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM automation_runs WHERE finished_at IS NOT NULL AND finished_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}
