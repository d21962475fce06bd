//! PostgreSQL run store tests. Require `DATABASE_URL`; run with
//! `cargo test -p evidence-db -- --ignored`.

use chrono::{Duration, Utc};
use evidence_core::error::CoreError;
use evidence_core::execution::ExecutionReport;
use evidence_core::request::ExecutionRequest;
use evidence_core::run::{RunRecord, RunStatus, RunTransition};
use evidence_core::run_store::RunStore;
use evidence_core::types::{OrganizationId, RunId, TaskId};
use evidence_db::PgRunStore;
use serde_json::json;
use sqlx::PgPool;

fn pending() -> RunRecord {
    let request = ExecutionRequest::new(
        OrganizationId::parse("acme").expect("org"),
        TaskId::parse("t1").expect("task"),
    );
    RunRecord::pending(RunId::generate(), &request)
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn records_follow_the_state_machine(pool: PgPool) {
    let store = PgRunStore::new(pool);
    let record = pending();
    let run_id = record.run_id.clone();
    store.insert(record.clone()).await.expect("insert");
    assert!(matches!(
        store.insert(record).await,
        Err(CoreError::Conflict(_))
    ));

    store
        .transition(&run_id, RunTransition::Started)
        .await
        .expect("start");
    let done = store
        .transition(
            &run_id,
            RunTransition::Finished(ExecutionReport::success(json!(42), vec![])),
        )
        .await
        .expect("finish");
    assert_eq!(done.status, RunStatus::Completed);

    let fetched = store.get(&run_id).await.expect("get").expect("present");
    assert_eq!(fetched, done);

    assert!(matches!(
        store.transition(&run_id, RunTransition::Canceled).await,
        Err(CoreError::Conflict(_))
    ));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn purge_removes_only_old_terminal_records(pool: PgPool) {
    let store = PgRunStore::new(pool);
    let finished = pending();
    let running = pending();
    store.insert(finished.clone()).await.expect("insert");
    store.insert(running.clone()).await.expect("insert");
    store
        .transition(&finished.run_id, RunTransition::Canceled)
        .await
        .expect("cancel");

    let purged = store
        .purge_finished_before(Utc::now() + Duration::seconds(1))
        .await
        .expect("purge");
    assert_eq!(purged, 1);
    assert!(store.get(&finished.run_id).await.expect("get").is_none());
    assert!(store.get(&running.run_id).await.expect("get").is_some());
}
