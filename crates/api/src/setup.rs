//! Builds the stores, sandbox backends, and run tracker described by a
//! [`ServerConfig`].

use std::sync::Arc;
use std::time::Duration;

use evidence_core::run_store::{MemoryRunStore, RunStore};
use evidence_sandbox::provisioner::{
    ExecutionMode, InteractiveBackend, LocalSandboxControl, RunnerSecrets, SingleInvocationBackend,
};
use evidence_sandbox::{CapabilityProfile, Provisioner};
use evidence_store::s3::S3BlobStore;
use evidence_store::sealed::FileSecretStore;
use evidence_store::{BlobStore, LocalBlobStore, ScriptStore, SecretStore};

use crate::config::{ExecutionBackend, ScriptStoreConfig, ServerConfig};
use crate::scripting::{RunTracker, TrackerConfig};

/// Extra time a silent interactive run gets before it is declared
/// `TIMED_OUT`.
pub const DETACHED_GRACE: Duration = Duration::from_secs(5);

/// Open the configured script store.
pub async fn script_store(config: &ServerConfig) -> ScriptStore {
    let blobs: Arc<dyn BlobStore> = match &config.script_store {
        ScriptStoreConfig::Local { dir } => {
            tracing::info!(dir = %dir.display(), "Using local script store");
            Arc::new(LocalBlobStore::new(dir.clone()))
        }
        ScriptStoreConfig::S3 { bucket, prefix } => {
            tracing::info!(bucket = %bucket, prefix = %prefix, "Using S3 script store");
            Arc::new(S3BlobStore::from_env(bucket.clone(), prefix.clone()).await)
        }
    };
    ScriptStore::new(blobs)
}

/// Sealed secret bundles, if configured.
pub fn secret_store(config: &ServerConfig) -> Option<Arc<dyn SecretStore>> {
    config.secrets.as_ref().map(|secrets| {
        Arc::new(FileSecretStore::new(
            secrets.dir.clone(),
            secrets.sealing_key.clone(),
        )) as Arc<dyn SecretStore>
    })
}

/// Route single-invocation runs per `EXECUTION_MODE` and, when
/// `SANDBOX_ROOT` is set, interactive runs to local sandboxes.
pub fn provisioner(config: &ServerConfig, scripts: &ScriptStore) -> Provisioner {
    let mode = match config.execution_backend {
        ExecutionBackend::InProcess => ExecutionMode::InProcess,
        ExecutionBackend::ChildProcess => ExecutionMode::ChildProcess {
            runner: config.runner_path.clone(),
            secrets: config.secrets.as_ref().map(|s| RunnerSecrets {
                dir: s.dir.clone(),
                key: s.key.clone(),
            }),
        },
    };

    let mut single = SingleInvocationBackend::new(scripts.clone(), mode)
        .with_profile(CapabilityProfile::default())
        .with_limits(config.limits);
    if let Some(secrets) = secret_store(config) {
        single = single.with_secrets(secrets);
    }
    let mut provisioner = Provisioner::new(Arc::new(single));

    if let Some(root) = &config.sandbox_root {
        let lifetime = config.limits.timeout() + DETACHED_GRACE;
        let control = LocalSandboxControl::new(root.clone()).with_max_command_duration(lifetime);
        let mut interactive = InteractiveBackend::new(
            Arc::new(control),
            scripts.clone(),
            config.runner_path.to_string_lossy().into_owned(),
        )
        .with_timeout_ms(config.limits.timeout_ms);
        if let Some(secrets) = &config.secrets {
            interactive = interactive
                .with_secrets(secrets.dir.to_string_lossy().into_owned(), secrets.key.clone());
        }
        tracing::info!(root = %root.display(), "Interactive sandboxes enabled");
        provisioner = provisioner.with_interactive(Arc::new(interactive));
    }

    provisioner
}

pub fn tracker_config(config: &ServerConfig) -> TrackerConfig {
    TrackerConfig {
        max_attempts: config.dispatch_max_attempts,
        execution_timeout: config.limits.timeout(),
        detached_grace: DETACHED_GRACE,
        ..TrackerConfig::default()
    }
}

/// Assemble the run tracker over `runs`.
pub fn run_tracker(
    config: &ServerConfig,
    scripts: &ScriptStore,
    runs: Arc<dyn RunStore>,
) -> RunTracker {
    RunTracker::new(
        runs,
        Arc::new(provisioner(config, scripts)),
        tracker_config(config),
    )
}

/// In-memory run store used when no database is configured.
pub fn memory_run_store() -> Arc<dyn RunStore> {
    Arc::new(MemoryRunStore::new())
}
