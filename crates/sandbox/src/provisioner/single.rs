//! Single-invocation backend: one throwaway environment per run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evidence_core::execution::{ErrorKind, ExecutionReport};
use evidence_store::{ScriptStore, SecretResolver, SecretStore, SecretValue};
use tokio::process::Command;

use super::{BackendRun, DetachedRun, DispatchJob, SandboxBackend};
use crate::capabilities::{CapabilityProfile, CapabilitySurface};
use crate::engine::{Engine, ExecutionJob, ExecutionLimits};
use crate::error::BackendError;
use crate::runner::{RunnerInput, SECRETS_KEY_ENV};
use crate::subprocess::{run_process, ProcessError, ProcessInput};

/// How long past the execution timeout a runner process may live before it
/// is killed.
const CHILD_GRACE: Duration = Duration::from_secs(1);

/// Sealed secret bundles made available to child runners.
#[derive(Debug, Clone)]
pub struct RunnerSecrets {
    pub dir: PathBuf,
    /// Base64 sealing key, handed to the runner through its environment.
    pub key: SecretValue,
}

#[derive(Debug, Clone)]
pub enum ExecutionMode {
    /// Run the engine on a thread of this process.
    InProcess,
    /// Spawn `evidence-runner --stdin` per execution.
    ChildProcess {
        runner: PathBuf,
        secrets: Option<RunnerSecrets>,
    },
}

pub struct SingleInvocationBackend {
    scripts: ScriptStore,
    secrets: Option<Arc<dyn SecretStore>>,
    profile: CapabilityProfile,
    limits: ExecutionLimits,
    mode: ExecutionMode,
    http: reqwest::Client,
}

impl SingleInvocationBackend {
    pub fn new(scripts: ScriptStore, mode: ExecutionMode) -> Self {
        Self {
            scripts,
            secrets: None,
            profile: CapabilityProfile::default(),
            limits: ExecutionLimits::default(),
            mode,
            http: reqwest::Client::new(),
        }
    }

    /// Secret store used in [`ExecutionMode::InProcess`].
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_profile(mut self, profile: CapabilityProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    async fn run_in_process(&self, job: ExecutionJob) -> ExecutionReport {
        let resolver = self
            .secrets
            .as_ref()
            .map(|store| SecretResolver::new(store.clone(), job.context.organization_id.clone()));
        let surface = CapabilitySurface::build(self.profile, resolver, self.http.clone());
        Engine::new(self.limits).execute(job, surface).await
    }

    async fn run_child(
        &self,
        job: ExecutionJob,
        runner: &Path,
        secrets: Option<&RunnerSecrets>,
    ) -> Result<ExecutionReport, BackendError> {
        let run_id = job.context.run_id.clone();
        let input = RunnerInput {
            source: job.source,
            event: job.event,
            context: job.context,
            limits: self.limits,
            profile: self.profile,
            secrets_dir: secrets.map(|s| s.dir.clone()),
        };
        let stdin = serde_json::to_vec(&input)
            .map_err(|e| BackendError::Unavailable(format!("failed to encode runner input: {e}")))?;

        let mut env = Vec::new();
        if let Some(secrets) = secrets {
            env.push((SECRETS_KEY_ENV.to_string(), secrets.key.expose().to_string()));
        }
        if let Ok(filter) = std::env::var("RUST_LOG") {
            env.push(("RUST_LOG".to_string(), filter));
        }

        let mut cmd = Command::new(runner);
        cmd.arg("--stdin");
        let result = run_process(
            &mut cmd,
            ProcessInput {
                stdin,
                env,
                timeout: self.limits.timeout() + CHILD_GRACE,
            },
        )
        .await;

        match result {
            Ok(output) => {
                if !output.stderr.is_empty() {
                    tracing::debug!(run_id = %run_id, stderr = %output.stderr.trim_end(), "Runner stderr");
                }
                match serde_json::from_str::<ExecutionReport>(output.stdout.trim()) {
                    Ok(report) => Ok(report),
                    Err(_) => {
                        tracing::warn!(
                            run_id = %run_id,
                            exit_code = output.exit_code,
                            "Runner exited without a report"
                        );
                        Ok(ExecutionReport::failure(
                            ErrorKind::ScriptError,
                            format!("runner exited with code {} without a report", output.exit_code),
                            Vec::new(),
                        ))
                    }
                }
            }
            Err(ProcessError::Timeout { elapsed_ms }) => {
                tracing::warn!(run_id = %run_id, elapsed_ms, "Runner killed after timeout");
                Ok(ExecutionReport::failure(
                    ErrorKind::TimedOut,
                    format!("execution exceeded {} ms", self.limits.timeout_ms),
                    Vec::new(),
                ))
            }
            Err(e) => Err(BackendError::Unavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl SandboxBackend for SingleInvocationBackend {
    async fn execute(&self, job: &DispatchJob) -> Result<BackendRun, BackendError> {
        let request = &job.request;
        let script = self
            .scripts
            .resolve(&request.organization_id, &request.task_id, request.slot)
            .await?;

        let exec = ExecutionJob {
            source: script.source,
            event: request.event.clone(),
            context: job.context(),
        };

        let report = match &self.mode {
            ExecutionMode::InProcess => self.run_in_process(exec).await,
            ExecutionMode::ChildProcess { runner, secrets } => {
                self.run_child(exec, runner, secrets.as_ref()).await?
            }
        };
        Ok(BackendRun::Finished(report))
    }

    async fn poll(&self, _run: &DetachedRun) -> Result<Option<ExecutionReport>, BackendError> {
        Err(BackendError::Unavailable(
            "single-invocation runs are never detached".into(),
        ))
    }

    async fn cancel(&self, _run: &DetachedRun) -> Result<(), BackendError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
