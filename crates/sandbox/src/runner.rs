//! The `evidence-runner` binary.
//!
//! The runner executes exactly one script and exits. It has two modes:
//!
//! - `--stdin`: reads a [`RunnerInput`] document from stdin and writes the
//!   [`ExecutionReport`] to stdout. Used by the single-invocation backend in
//!   child-process mode.
//! - file mode: reads the module and event from files inside a sandbox and
//!   writes the report to `--output`. Used by the interactive backend,
//!   which polls for the output file.
//!
//! Secrets are read from sealed bundles in `--secrets-dir`, opened with the
//! key in `EVIDENCE_SECRETS_KEY`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use evidence_core::error::CoreError;
use evidence_core::execution::{ErrorKind, ExecutionReport, InvocationContext};
use evidence_core::types::{OrganizationId, RunId, TaskId};
use evidence_store::sealed::{FileSecretStore, SealingKey};
use evidence_store::SecretResolver;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::capabilities::{CapabilityProfile, CapabilitySurface};
use crate::engine::{Engine, ExecutionJob, ExecutionLimits};

/// Environment variable holding the base64 sealing key.
pub const SECRETS_KEY_ENV: &str = "EVIDENCE_SECRETS_KEY";

/// Request document accepted on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInput {
    pub source: String,
    #[serde(default)]
    pub event: Value,
    pub context: InvocationContext,
    #[serde(default)]
    pub limits: ExecutionLimits,
    #[serde(default)]
    pub profile: CapabilityProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[command(name = "evidence-runner", about = "Run one automation script in a sandbox")]
pub struct RunnerArgs {
    /// Read a JSON request from stdin and write the report to stdout.
    #[arg(long, conflicts_with_all = ["module", "output"])]
    pub stdin: bool,

    /// Path to the module source.
    #[arg(long, requires_all = ["output", "organization", "task", "run"])]
    pub module: Option<PathBuf>,

    /// Path to the event JSON. A missing file means a `null` event.
    #[arg(long)]
    pub event: Option<PathBuf>,

    /// Where to write the report.
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub organization: Option<String>,

    #[arg(long)]
    pub task: Option<String>,

    #[arg(long)]
    pub run: Option<String>,

    /// Wall-clock budget in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Directory of sealed secret bundles.
    #[arg(long)]
    pub secrets_dir: Option<PathBuf>,
}

/// Log to stderr; stdout carries the report in `--stdin` mode.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evidence_sandbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Execute one request in-process.
pub async fn execute(input: RunnerInput) -> ExecutionReport {
    let secrets = input
        .secrets_dir
        .as_deref()
        .and_then(|dir| secret_resolver(dir, &input.context.organization_id));
    let surface = CapabilitySurface::build(input.profile, secrets, reqwest::Client::new());
    let job = ExecutionJob {
        source: input.source,
        event: input.event,
        context: input.context,
    };
    Engine::new(input.limits).execute(job, surface).await
}

fn secret_resolver(dir: &Path, organization_id: &OrganizationId) -> Option<SecretResolver> {
    let encoded = match std::env::var(SECRETS_KEY_ENV) {
        Ok(encoded) => encoded,
        Err(_) => {
            tracing::warn!("{SECRETS_KEY_ENV} is not set, secrets are unavailable");
            return None;
        }
    };
    match SealingKey::from_base64(&encoded) {
        Ok(key) => Some(SecretResolver::new(
            Arc::new(FileSecretStore::new(dir, key)),
            organization_id.clone(),
        )),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid sealing key, secrets are unavailable");
            None
        }
    }
}

/// Entry point of the binary.
pub async fn run(args: RunnerArgs) -> anyhow::Result<()> {
    if args.stdin {
        let mut raw = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut raw)
            .await
            .context("failed to read request from stdin")?;
        let input: RunnerInput =
            serde_json::from_slice(&raw).context("invalid runner request")?;
        let report = execute(input).await;
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    let module = args
        .module
        .clone()
        .context("either --stdin or --module is required")?;
    let output = args.output.clone().context("--output is required")?;

    let report = match file_request(args, &module).await {
        Ok(input) => {
            tracing::info!(run_id = %input.context.run_id, module = %module.display(), "Running automation");
            execute(input).await
        }
        Err(report) => {
            tracing::warn!(
                module = %module.display(),
                error = report.message.as_deref().unwrap_or_default(),
                "Automation could not be started"
            );
            report
        }
    };

    write_report(&output, &report).await
}

/// Assemble the file-mode request. Anything that keeps the script from
/// running is returned as a failure report, so the poller always finds a
/// result in `--output`.
async fn file_request(args: RunnerArgs, module: &Path) -> Result<RunnerInput, ExecutionReport> {
    let rejected = |message: String| ExecutionReport::failure(ErrorKind::ScriptError, message, Vec::new());

    let context = invocation_context(&args).map_err(|e| rejected(format!("invalid invocation: {e}")))?;
    let source = tokio::fs::read_to_string(module).await.map_err(|e| {
        ExecutionReport::failure(
            ErrorKind::NotFound,
            format!("cannot read module {}: {e}", module.display()),
            Vec::new(),
        )
    })?;
    let event = match &args.event {
        Some(path) => read_event(path).await.map_err(|e| rejected(format!("{e:#}")))?,
        None => Value::Null,
    };

    let mut limits = ExecutionLimits::default();
    if let Some(timeout_ms) = args.timeout_ms {
        limits.timeout_ms = timeout_ms;
    }
    Ok(RunnerInput {
        source,
        event,
        context,
        limits,
        profile: CapabilityProfile::default(),
        secrets_dir: args.secrets_dir,
    })
}

fn invocation_context(args: &RunnerArgs) -> Result<InvocationContext, CoreError> {
    Ok(InvocationContext {
        organization_id: OrganizationId::parse(args.organization.as_deref().unwrap_or_default())?,
        task_id: TaskId::parse(args.task.as_deref().unwrap_or_default())?,
        run_id: RunId::parse(args.run.as_deref().unwrap_or_default())?,
    })
}

async fn read_event(path: &Path) -> anyhow::Result<Value> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("event file {} is not JSON", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Null),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Write `report` so that a poller never observes a partial file.
pub async fn write_report(path: &Path, report: &ExecutionReport) -> anyhow::Result<()> {
    let json = serde_json::to_vec(report)?;
    let tmp = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move report into {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
