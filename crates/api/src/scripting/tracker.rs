//! Run tracker.
//!
//! Owns the lifecycle of every dispatched run: creates the `PENDING`
//! record, drives the sandbox backend on a spawned task (retrying
//! infrastructure failures), observes detached runs through
//! [`SandboxBackend::poll`], and records exactly one terminal status.
//! Held in [`AppState`](crate::state::AppState).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use evidence_core::error::CoreError;
use evidence_core::execution::{ErrorKind, ExecutionReport};
use evidence_core::request::ExecutionRequest;
use evidence_core::run::{RunRecord, RunTransition};
use evidence_core::run_store::RunStore;
use evidence_core::types::{OrganizationId, RunId};
use evidence_sandbox::{BackendError, BackendRun, DetachedRun, DispatchJob, SandboxBackend};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Upper bound on the delay between two attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Attempts per run, including the first. Only retryable kinds use more
    /// than one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub retry_base_delay: Duration,
    /// Interval between two reads of a detached run's result.
    pub poll_interval: Duration,
    /// Wall-clock budget of one execution.
    pub execution_timeout: Duration,
    /// How long past `execution_timeout` a detached run may stay silent
    /// before it is recorded as `TIMED_OUT`.
    pub detached_grace: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(250),
            execution_timeout: Duration::from_secs(3),
            detached_grace: Duration::from_secs(5),
        }
    }
}

impl TrackerConfig {
    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}

struct ActiveRun {
    handle: JoinHandle<()>,
    detached: Option<DetachedRun>,
}

/// Dispatches runs and answers status queries.
///
/// Cheap to clone; clones share the run store, the backend, and the table
/// of in-flight runs.
#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn RunStore>,
    backend: Arc<dyn SandboxBackend>,
    config: TrackerConfig,
    active: Arc<Mutex<HashMap<RunId, ActiveRun>>>,
}

impl RunTracker {
    pub fn new(
        store: Arc<dyn RunStore>,
        backend: Arc<dyn SandboxBackend>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            store,
            backend,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a `PENDING` run and start executing it in the background.
    ///
    /// Returns as soon as the record exists; the run id is immediately
    /// visible to [`status`](Self::status).
    pub async fn dispatch(&self, request: ExecutionRequest) -> Result<RunId, CoreError> {
        let run_id = RunId::generate();
        self.store
            .insert(RunRecord::pending(run_id.clone(), &request))
            .await?;

        tracing::info!(
            run_id = %run_id,
            organization_id = %request.organization_id,
            task_id = %request.task_id,
            sandbox_id = ?request.sandbox_id,
            "Run dispatched"
        );

        // Holding the table lock across the spawn keeps the task from
        // removing its entry before it was inserted.
        let mut active = self.active.lock().await;
        let tracker = self.clone();
        let id = run_id.clone();
        let handle = tokio::spawn(async move { tracker.drive(id, request).await });
        active.insert(
            run_id.clone(),
            ActiveRun {
                handle,
                detached: None,
            },
        );
        Ok(run_id)
    }

    /// Current record of `run_id`.
    ///
    /// With `organization_id`, a run owned by another organization is
    /// reported as missing.
    pub async fn status(
        &self,
        run_id: &RunId,
        organization_id: Option<&OrganizationId>,
    ) -> Result<Option<RunRecord>, CoreError> {
        let record = self.store.get(run_id).await?;
        Ok(record.filter(|r| organization_id.map_or(true, |org| &r.organization_id == org)))
    }

    /// Stop a run and record it as `CANCELED`. Terminal runs are returned
    /// unchanged.
    pub async fn cancel(
        &self,
        run_id: &RunId,
        organization_id: &OrganizationId,
    ) -> Result<Option<RunRecord>, CoreError> {
        let Some(record) = self.status(run_id, Some(organization_id)).await? else {
            return Ok(None);
        };
        if record.status.is_terminal() {
            return Ok(Some(record));
        }

        self.stop(run_id).await;
        match self.store.transition(run_id, RunTransition::Canceled).await {
            Ok(record) => {
                tracing::info!(run_id = %run_id, organization_id = %organization_id, "Run canceled");
                Ok(Some(record))
            }
            // Finished between the read and the cancel.
            Err(CoreError::Conflict(_)) => self.status(run_id, Some(organization_id)).await,
            Err(e) => Err(e),
        }
    }

    /// Number of runs whose execution task is still alive.
    pub async fn active_runs(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Wait up to `timeout` for in-flight runs, then cancel the rest.
    pub async fn shutdown(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.active_runs().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining: Vec<RunId> = self.active.lock().await.keys().cloned().collect();
        for run_id in remaining {
            self.stop(&run_id).await;
            match self.store.transition(&run_id, RunTransition::Canceled).await {
                Ok(_) => tracing::warn!(run_id = %run_id, "Run canceled by shutdown"),
                Err(e) => tracing::debug!(run_id = %run_id, error = %e, "Run already settled at shutdown"),
            }
        }
    }

    // -- Execution task --------------------------------------------------

    async fn drive(self, run_id: RunId, request: ExecutionRequest) {
        if let Err(e) = self.store.transition(&run_id, RunTransition::Started).await {
            tracing::warn!(run_id = %run_id, error = %e, "Run could not be started");
            self.forget(&run_id).await;
            return;
        }

        let report = self.execute(&run_id, &request).await;

        match self
            .store
            .transition(&run_id, RunTransition::Finished(report))
            .await
        {
            Ok(record) => tracing::info!(
                run_id = %run_id,
                organization_id = %record.organization_id,
                task_id = %record.task_id,
                status = record.status.as_str(),
                attempts = record.attempts,
                "Run finished"
            ),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Failed to record run result"),
        }
        self.forget(&run_id).await;
    }

    async fn execute(&self, run_id: &RunId, request: &ExecutionRequest) -> ExecutionReport {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if let Err(e) = self
                .store
                .transition(run_id, RunTransition::Attempt(attempt))
                .await
            {
                tracing::warn!(run_id = %run_id, attempt, error = %e, "Failed to record attempt");
            }

            let job = DispatchJob {
                run_id: run_id.clone(),
                request: request.clone(),
                attempt,
            };
            let outcome = match self.backend.execute(&job).await {
                Ok(BackendRun::Finished(report)) => Ok(report),
                Ok(BackendRun::Detached(run)) => Ok(self.observe(run).await),
                Err(e) => Err(e),
            };

            let (kind, message) = match outcome {
                Ok(report) => match report.failure_kind() {
                    Some(kind) if kind.is_retryable() && attempt < max_attempts => {
                        (kind, report.message.unwrap_or_default())
                    }
                    _ => return report,
                },
                Err(e) => {
                    let kind = e.kind();
                    if !kind.is_retryable() || attempt >= max_attempts {
                        tracing::warn!(
                            run_id = %run_id,
                            attempt,
                            error_kind = %kind,
                            error = %e,
                            "Run failed before the script could report"
                        );
                        return ExecutionReport::failure(kind, tenant_message(&e), Vec::new());
                    }
                    (kind, e.to_string())
                }
            };

            let delay = self.config.retry_delay(attempt);
            tracing::warn!(
                run_id = %run_id,
                attempt,
                error_kind = %kind,
                error = %message,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying run after infrastructure failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Poll a detached run until it reports or its budget runs out.
    async fn observe(&self, run: DetachedRun) -> ExecutionReport {
        if let Some(entry) = self.active.lock().await.get_mut(&run.run_id) {
            entry.detached = Some(run.clone());
        }

        let deadline = Instant::now() + self.config.execution_timeout + self.config.detached_grace;
        loop {
            match self.backend.poll(&run).await {
                Ok(Some(report)) => return report,
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    run_id = %run.run_id,
                    sandbox_id = %run.sandbox_id,
                    error = %e,
                    "Failed to read detached run result"
                ),
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    run_id = %run.run_id,
                    sandbox_id = %run.sandbox_id,
                    command_id = %run.command_id,
                    "Detached run produced no result in time, killing"
                );
                if let Err(e) = self.backend.cancel(&run).await {
                    tracing::warn!(run_id = %run.run_id, error = %e, "Failed to kill detached run");
                }
                return ExecutionReport::failure(
                    ErrorKind::TimedOut,
                    format!(
                        "no result within {} ms",
                        self.config.execution_timeout.as_millis()
                    ),
                    Vec::new(),
                );
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn stop(&self, run_id: &RunId) {
        let entry = self.active.lock().await.remove(run_id);
        if let Some(entry) = entry {
            entry.handle.abort();
            // Without a detached handle the task may have been stopped
            // inside `execute`, after the backend already started work.
            let stopped = match entry.detached {
                Some(run) => self.backend.cancel(&run).await,
                None => self.backend.abandon(run_id).await,
            };
            if let Err(e) = stopped {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to kill detached run");
            }
        }
    }

    async fn forget(&self, run_id: &RunId) {
        self.active.lock().await.remove(run_id);
    }
}

/// Failure message stored on the run. Host details stay in the logs.
fn tenant_message(error: &BackendError) -> String {
    match error.kind() {
        ErrorKind::StoreUnavailable => "script store unavailable".to_string(),
        ErrorKind::SandboxUnavailable => "sandbox unavailable".to_string(),
        _ => error.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
