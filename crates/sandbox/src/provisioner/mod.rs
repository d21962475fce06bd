//! Sandbox provisioning.
//!
//! A [`SandboxBackend`] turns a [`DispatchJob`] into an execution. Two
//! backends exist:
//!
//! - [`single::SingleInvocationBackend`]: a throwaway environment per run.
//!   Returns the report synchronously.
//! - [`interactive::InteractiveBackend`]: a named sandbox that persists
//!   between runs. The runner is started detached and the caller observes
//!   the result file through [`SandboxBackend::poll`].
//!
//! [`Provisioner`] picks one based on whether the request names a sandbox.

pub mod interactive;
pub mod local;
pub mod single;

use std::sync::Arc;

use async_trait::async_trait;
use evidence_core::execution::{ExecutionReport, InvocationContext};
use evidence_core::request::ExecutionRequest;
use evidence_core::types::{RunId, SandboxId};

use crate::error::BackendError;

pub use interactive::{InteractiveBackend, SandboxCommand, SandboxControl, SandboxState};
pub use local::LocalSandboxControl;
pub use single::{ExecutionMode, RunnerSecrets, SingleInvocationBackend};

/// One attempt at executing a run.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub run_id: RunId,
    pub request: ExecutionRequest,
    pub attempt: u32,
}

impl DispatchJob {
    pub fn context(&self) -> InvocationContext {
        InvocationContext {
            organization_id: self.request.organization_id.clone(),
            task_id: self.request.task_id.clone(),
            run_id: self.run_id.clone(),
        }
    }
}

/// Handle to a runner started detached inside an interactive sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedRun {
    pub run_id: RunId,
    pub sandbox_id: SandboxId,
    pub command_id: String,
    /// Sandbox-relative path the runner writes its report to.
    pub result_path: String,
}

/// What a backend returned for a job.
#[derive(Debug, Clone)]
pub enum BackendRun {
    Finished(ExecutionReport),
    Detached(DetachedRun),
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Start (and for synchronous backends, finish) one execution.
    async fn execute(&self, job: &DispatchJob) -> Result<BackendRun, BackendError>;

    /// Read the report of a detached run, `None` while it is still running.
    async fn poll(&self, run: &DetachedRun) -> Result<Option<ExecutionReport>, BackendError>;

    /// Stop a detached run.
    async fn cancel(&self, run: &DetachedRun) -> Result<(), BackendError>;

    /// Stop whatever `execute` started for `run_id` after the caller dropped
    /// the `execute` future before it returned.
    async fn abandon(&self, _run_id: &RunId) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Routes jobs to the single-invocation or the interactive backend.
#[derive(Clone)]
pub struct Provisioner {
    single: Arc<dyn SandboxBackend>,
    interactive: Option<Arc<dyn SandboxBackend>>,
}

impl Provisioner {
    pub fn new(single: Arc<dyn SandboxBackend>) -> Self {
        Self {
            single,
            interactive: None,
        }
    }

    pub fn with_interactive(mut self, interactive: Arc<dyn SandboxBackend>) -> Self {
        self.interactive = Some(interactive);
        self
    }

    fn interactive(&self) -> Result<&Arc<dyn SandboxBackend>, BackendError> {
        self.interactive
            .as_ref()
            .ok_or_else(|| BackendError::Unavailable("interactive sandboxes are not configured".into()))
    }
}

#[async_trait]
impl SandboxBackend for Provisioner {
    async fn execute(&self, job: &DispatchJob) -> Result<BackendRun, BackendError> {
        if job.request.sandbox_id.is_some() {
            self.interactive()?.execute(job).await
        } else {
            self.single.execute(job).await
        }
    }

    async fn poll(&self, run: &DetachedRun) -> Result<Option<ExecutionReport>, BackendError> {
        self.interactive()?.poll(run).await
    }

    async fn cancel(&self, run: &DetachedRun) -> Result<(), BackendError> {
        self.interactive()?.cancel(run).await
    }

    async fn abandon(&self, run_id: &RunId) -> Result<(), BackendError> {
        match &self.interactive {
            Some(interactive) => interactive.abandon(run_id).await,
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use evidence_core::types::{OrganizationId, TaskId};
    use serde_json::json;

    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl SandboxBackend for Fixed {
        async fn execute(&self, _job: &DispatchJob) -> Result<BackendRun, BackendError> {
            Ok(BackendRun::Finished(ExecutionReport::success(json!(self.0), vec![])))
        }

        async fn poll(&self, _run: &DetachedRun) -> Result<Option<ExecutionReport>, BackendError> {
            Ok(None)
        }

        async fn cancel(&self, _run: &DetachedRun) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn job(sandbox: Option<&str>) -> DispatchJob {
        let mut request = ExecutionRequest::new(
            OrganizationId::parse("acme").expect("org"),
            TaskId::parse("t1").expect("task"),
        );
        if let Some(id) = sandbox {
            request = request.with_sandbox(SandboxId::parse(id).expect("sandbox"));
        }
        DispatchJob {
            run_id: RunId::generate(),
            request,
            attempt: 1,
        }
    }

    fn result(run: BackendRun) -> serde_json::Value {
        match run {
            BackendRun::Finished(report) => report.result,
            BackendRun::Detached(_) => panic!("expected a finished run"),
        }
    }

    #[tokio::test]
    async fn selects_backend_by_sandbox_id() {
        let provisioner =
            Provisioner::new(Arc::new(Fixed("single"))).with_interactive(Arc::new(Fixed("interactive")));

        let single = provisioner.execute(&job(None)).await.expect("single");
        assert_eq!(result(single), json!("single"));

        let interactive = provisioner.execute(&job(Some("sbx-1"))).await.expect("interactive");
        assert_eq!(result(interactive), json!("interactive"));
    }

    #[tokio::test]
    async fn missing_interactive_backend_is_unavailable() {
        let provisioner = Provisioner::new(Arc::new(Fixed("single")));
        let err = provisioner
            .execute(&job(Some("sbx-1")))
            .await
            .expect_err("no interactive backend");
        assert_matches!(err, BackendError::Unavailable(_));
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn job_context_carries_ids() {
        let job = job(None);
        let ctx = job.context();
        assert_eq!(ctx.run_id, job.run_id);
        assert_eq!(ctx.organization_id.as_str(), "acme");
    }
}
