//! Interactive backend: named sandboxes that persist between runs.
//!
//! ```text
//! Unprovisioned ──create──► Provisioned ──write──► FilesWritten ──run──► Running
//!                                                      ▲                    │
//!                                                      └──write── Idle ◄────┘
//! ```
//!
//! Each run writes the current script and its event into the sandbox,
//! starts `evidence-runner` detached and returns a [`DetachedRun`]. The
//! caller polls for the result file. Files are laid out per tenant:
//!
//! ```text
//! automations/{organization_id}/{task_id}/script.js
//! automations/{organization_id}/{task_id}/runs/{run_id}/event.json
//! automations/{organization_id}/{task_id}/runs/{run_id}/result.json
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use evidence_core::execution::{ErrorKind, ExecutionReport};
use evidence_core::types::{OrganizationId, RunId, SandboxId, TaskId};
use evidence_store::{ScriptStore, SecretValue};
use tokio::sync::RwLock;

use super::{BackendRun, DetachedRun, DispatchJob, SandboxBackend};
use crate::engine::DEFAULT_TIMEOUT_MS;
use crate::error::BackendError;
use crate::runner::SECRETS_KEY_ENV;

/// A command started inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Provider operations the interactive backend relies on.
#[async_trait]
pub trait SandboxControl: Send + Sync {
    /// Create a sandbox owned by `organization_id`. Creating an existing
    /// sandbox for its owner is a no-op.
    async fn create(
        &self,
        sandbox_id: &SandboxId,
        organization_id: &OrganizationId,
    ) -> Result<(), BackendError>;

    /// The owner of `sandbox_id`, or `None` if it does not exist.
    async fn exists(&self, sandbox_id: &SandboxId) -> Result<Option<OrganizationId>, BackendError>;

    /// Write (or overwrite) a file at a sandbox-relative path.
    async fn write_file(
        &self,
        sandbox_id: &SandboxId,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError>;

    /// Read a file at a sandbox-relative path, `None` if it does not exist.
    async fn read_file(&self, sandbox_id: &SandboxId, path: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Start `command` detached under `command_id`. The id is chosen by the
    /// caller, so the command can be killed even if this call never returns.
    async fn run_command(
        &self,
        sandbox_id: &SandboxId,
        command_id: &str,
        command: &SandboxCommand,
    ) -> Result<(), BackendError>;

    /// Kill a detached command. Unknown or finished commands are ignored.
    async fn kill_command(&self, sandbox_id: &SandboxId, command_id: &str) -> Result<(), BackendError>;
}

/// Last known state of one sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Unprovisioned,
    Provisioned,
    FilesWritten,
    Running,
    Idle,
}

pub fn script_path(organization_id: &OrganizationId, task_id: &TaskId) -> String {
    format!("automations/{organization_id}/{task_id}/script.js")
}

pub fn run_dir(organization_id: &OrganizationId, task_id: &TaskId, run_id: &RunId) -> String {
    format!("automations/{organization_id}/{task_id}/runs/{run_id}")
}

/// Command id of one attempt at a run.
pub fn command_id(run_id: &RunId, attempt: u32) -> String {
    format!("{run_id}-a{attempt}")
}

pub struct InteractiveBackend {
    control: Arc<dyn SandboxControl>,
    scripts: ScriptStore,
    runner: String,
    timeout_ms: u64,
    secrets: Option<(String, SecretValue)>,
    states: RwLock<HashMap<SandboxId, SandboxState>>,
    /// Commands started (or being started) per run, until the run reports
    /// or is stopped.
    launched: Mutex<HashMap<RunId, (SandboxId, String)>>,
}

impl InteractiveBackend {
    /// `runner` is the path of `evidence-runner` as seen from inside the
    /// sandbox.
    pub fn new(control: Arc<dyn SandboxControl>, scripts: ScriptStore, runner: impl Into<String>) -> Self {
        Self {
            control,
            scripts,
            runner: runner.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            secrets: None,
            states: RwLock::new(HashMap::new()),
            launched: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Sealed bundle directory (as seen from inside the sandbox) and the key
    /// that opens it.
    pub fn with_secrets(mut self, dir: impl Into<String>, key: SecretValue) -> Self {
        self.secrets = Some((dir.into(), key));
        self
    }

    pub async fn state(&self, sandbox_id: &SandboxId) -> SandboxState {
        self.states
            .read()
            .await
            .get(sandbox_id)
            .copied()
            .unwrap_or(SandboxState::Unprovisioned)
    }

    /// Number of runs whose command has not reported or been stopped.
    pub fn launched_runs(&self) -> usize {
        self.launched.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn track(&self, run_id: &RunId, sandbox_id: &SandboxId, command_id: &str) {
        if let Ok(mut launched) = self.launched.lock() {
            launched.insert(run_id.clone(), (sandbox_id.clone(), command_id.to_string()));
        }
    }

    fn untrack(&self, run_id: &RunId) -> Option<(SandboxId, String)> {
        self.launched.lock().ok().and_then(|mut l| l.remove(run_id))
    }

    async fn set_state(&self, sandbox_id: &SandboxId, next: SandboxState) {
        let previous = self.states.write().await.insert(sandbox_id.clone(), next);
        tracing::debug!(sandbox_id = %sandbox_id, ?previous, ?next, "Sandbox state changed");
    }

    /// Reuse the sandbox if `organization_id` owns it, create it if it does
    /// not exist. Another organization's sandbox reads as not found.
    async fn provision(
        &self,
        sandbox_id: &SandboxId,
        organization_id: &OrganizationId,
    ) -> Result<(), BackendError> {
        match self.control.exists(sandbox_id).await? {
            Some(owner) if &owner == organization_id => {
                if self.state(sandbox_id).await == SandboxState::Unprovisioned {
                    self.set_state(sandbox_id, SandboxState::Provisioned).await;
                }
                Ok(())
            }
            Some(_) => Err(BackendError::SandboxNotFound(sandbox_id.clone())),
            None => {
                self.control.create(sandbox_id, organization_id).await?;
                tracing::info!(sandbox_id = %sandbox_id, organization_id = %organization_id, "Provisioned sandbox");
                self.set_state(sandbox_id, SandboxState::Provisioned).await;
                Ok(())
            }
        }
    }

    fn command(&self, job: &DispatchJob, script: &str, dir: &str) -> SandboxCommand {
        let request = &job.request;
        let mut args = vec![
            "--module".to_string(),
            script.to_string(),
            "--event".to_string(),
            format!("{dir}/event.json"),
            "--output".to_string(),
            format!("{dir}/result.json"),
            "--organization".to_string(),
            request.organization_id.to_string(),
            "--task".to_string(),
            request.task_id.to_string(),
            "--run".to_string(),
            job.run_id.to_string(),
            "--timeout-ms".to_string(),
            self.timeout_ms.to_string(),
        ];
        let mut env = Vec::new();
        if let Some((secrets_dir, key)) = &self.secrets {
            args.push("--secrets-dir".to_string());
            args.push(secrets_dir.clone());
            env.push((SECRETS_KEY_ENV.to_string(), key.expose().to_string()));
        }
        SandboxCommand {
            program: self.runner.clone(),
            args,
            env,
        }
    }
}

#[async_trait]
impl SandboxBackend for InteractiveBackend {
    async fn execute(&self, job: &DispatchJob) -> Result<BackendRun, BackendError> {
        let request = &job.request;
        let sandbox_id = request
            .sandbox_id
            .clone()
            .ok_or_else(|| BackendError::Unavailable("interactive run without a sandbox id".into()))?;

        let source = self
            .scripts
            .resolve(&request.organization_id, &request.task_id, request.slot)
            .await?;

        self.provision(&sandbox_id, &request.organization_id).await?;

        let script = script_path(&request.organization_id, &request.task_id);
        let dir = run_dir(&request.organization_id, &request.task_id, &job.run_id);
        let event = serde_json::to_vec(&request.event)
            .map_err(|e| BackendError::Unavailable(format!("failed to encode event: {e}")))?;
        self.control
            .write_file(&sandbox_id, &script, source.source.as_bytes())
            .await?;
        self.control
            .write_file(&sandbox_id, &format!("{dir}/event.json"), &event)
            .await?;
        self.set_state(&sandbox_id, SandboxState::FilesWritten).await;

        let command_id = command_id(&job.run_id, job.attempt);
        self.track(&job.run_id, &sandbox_id, &command_id);
        if let Err(e) = self
            .control
            .run_command(&sandbox_id, &command_id, &self.command(job, &script, &dir))
            .await
        {
            self.untrack(&job.run_id);
            return Err(e);
        }
        self.set_state(&sandbox_id, SandboxState::Running).await;

        tracing::info!(
            run_id = %job.run_id,
            sandbox_id = %sandbox_id,
            command_id = %command_id,
            "Started detached runner"
        );

        Ok(BackendRun::Detached(DetachedRun {
            run_id: job.run_id.clone(),
            sandbox_id,
            command_id,
            result_path: format!("{dir}/result.json"),
        }))
    }

    async fn poll(&self, run: &DetachedRun) -> Result<Option<ExecutionReport>, BackendError> {
        let Some(bytes) = self.control.read_file(&run.sandbox_id, &run.result_path).await? else {
            return Ok(None);
        };
        self.untrack(&run.run_id);
        self.set_state(&run.sandbox_id, SandboxState::Idle).await;
        let report = serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(run_id = %run.run_id, error = %e, "Unreadable runner report");
            ExecutionReport::failure(
                ErrorKind::ScriptError,
                "runner wrote an unreadable report",
                Vec::new(),
            )
        });
        Ok(Some(report))
    }

    async fn cancel(&self, run: &DetachedRun) -> Result<(), BackendError> {
        self.untrack(&run.run_id);
        self.control
            .kill_command(&run.sandbox_id, &run.command_id)
            .await?;
        self.set_state(&run.sandbox_id, SandboxState::Idle).await;
        Ok(())
    }

    async fn abandon(&self, run_id: &RunId) -> Result<(), BackendError> {
        let Some((sandbox_id, command_id)) = self.untrack(run_id) else {
            return Ok(());
        };
        tracing::info!(run_id = %run_id, sandbox_id = %sandbox_id, command_id = %command_id, "Killing runner of an abandoned run");
        self.control.kill_command(&sandbox_id, &command_id).await?;
        self.set_state(&sandbox_id, SandboxState::Idle).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
