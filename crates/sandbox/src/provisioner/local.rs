//! [`SandboxControl`] backed by local directories and detached processes.
//!
//! Each sandbox is a directory `{root}/{sandbox_id}` holding an `.owner`
//! file with the owning organization id. Commands run with the sandbox
//! directory as working directory and a cleared environment; their output
//! goes to `.commands/{command_id}.log`. A command still running after the
//! maximum command duration is killed.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evidence_core::types::{validate_identifier, OrganizationId, SandboxId};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};

use super::interactive::{SandboxCommand, SandboxControl};
use crate::error::BackendError;

const OWNER_FILE: &str = ".owner";
const COMMANDS_DIR: &str = ".commands";

/// Default lifetime of a detached command.
pub const DEFAULT_MAX_COMMAND_DURATION: Duration = Duration::from_secs(60);

type CommandTable = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

#[derive(Clone)]
pub struct LocalSandboxControl {
    root: PathBuf,
    max_command_duration: Duration,
    commands: CommandTable,
}

impl LocalSandboxControl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_command_duration: DEFAULT_MAX_COMMAND_DURATION,
            commands: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_max_command_duration(mut self, duration: Duration) -> Self {
        self.max_command_duration = duration;
        self
    }

    pub fn sandbox_dir(&self, sandbox_id: &SandboxId) -> PathBuf {
        self.root.join(sandbox_id.as_str())
    }

    /// Number of commands still running.
    pub async fn running_commands(&self) -> usize {
        self.commands.lock().await.len()
    }

    /// Resolve a sandbox-relative path, refusing anything that escapes the
    /// sandbox directory.
    fn resolve(&self, sandbox_id: &SandboxId, path: &str) -> Result<PathBuf, BackendError> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(BackendError::Unavailable(format!(
                "invalid sandbox path: {path}"
            )));
        }
        Ok(self.sandbox_dir(sandbox_id).join(relative))
    }

    async fn require(&self, sandbox_id: &SandboxId) -> Result<(), BackendError> {
        match self.exists(sandbox_id).await? {
            Some(_) => Ok(()),
            None => Err(BackendError::SandboxNotFound(sandbox_id.clone())),
        }
    }
}

fn io_error(context: &str, e: std::io::Error) -> BackendError {
    BackendError::Unavailable(format!("{context}: {e}"))
}

#[async_trait]
impl SandboxControl for LocalSandboxControl {
    async fn create(
        &self,
        sandbox_id: &SandboxId,
        organization_id: &OrganizationId,
    ) -> Result<(), BackendError> {
        if let Some(owner) = self.exists(sandbox_id).await? {
            return if &owner == organization_id {
                Ok(())
            } else {
                Err(BackendError::SandboxNotFound(sandbox_id.clone()))
            };
        }
        let dir = self.sandbox_dir(sandbox_id);
        tokio::fs::create_dir_all(dir.join(COMMANDS_DIR))
            .await
            .map_err(|e| io_error("failed to create sandbox", e))?;
        tokio::fs::write(dir.join(OWNER_FILE), organization_id.as_str())
            .await
            .map_err(|e| io_error("failed to record sandbox owner", e))?;
        Ok(())
    }

    async fn exists(&self, sandbox_id: &SandboxId) -> Result<Option<OrganizationId>, BackendError> {
        let path = self.sandbox_dir(sandbox_id).join(OWNER_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(owner) => OrganizationId::parse(owner.trim())
                .map(Some)
                .map_err(|e| BackendError::Unavailable(format!("corrupt sandbox owner: {e}"))),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("failed to read sandbox owner", e)),
        }
    }

    async fn write_file(
        &self,
        sandbox_id: &SandboxId,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        self.require(sandbox_id).await?;
        let target = self.resolve(sandbox_id, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("failed to create directory", e))?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(|e| io_error("failed to write file", e))
    }

    async fn read_file(&self, sandbox_id: &SandboxId, path: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let target = self.resolve(sandbox_id, path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("failed to read file", e)),
        }
    }

    async fn run_command(
        &self,
        sandbox_id: &SandboxId,
        command_id: &str,
        command: &SandboxCommand,
    ) -> Result<(), BackendError> {
        validate_identifier("command", command_id)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        self.require(sandbox_id).await?;
        let dir = self.sandbox_dir(sandbox_id);

        tokio::fs::create_dir_all(dir.join(COMMANDS_DIR))
            .await
            .map_err(|e| io_error("failed to create command log directory", e))?;
        let log = std::fs::File::create(dir.join(COMMANDS_DIR).join(format!("{command_id}.log")))
            .map_err(|e| io_error("failed to create command log", e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| io_error("failed to create command log", e))?;

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Unavailable(format!("failed to start {}: {e}", command.program)))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.commands.lock().await.insert(command_id.to_string(), kill_tx);

        let commands = Arc::clone(&self.commands);
        let max_duration = self.max_command_duration;
        let id = command_id.to_string();
        let sandbox = sandbox_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    tracing::debug!(sandbox_id = %sandbox, command_id = %id, ?status, "Sandbox command exited");
                }
                _ = tokio::time::sleep(max_duration) => {
                    tracing::warn!(sandbox_id = %sandbox, command_id = %id, "Sandbox command exceeded its lifetime, killing");
                    let _ = child.kill().await;
                }
                _ = kill_rx => {
                    tracing::info!(sandbox_id = %sandbox, command_id = %id, "Killing sandbox command");
                    let _ = child.kill().await;
                }
            }
            commands.lock().await.remove(&id);
        });

        Ok(())
    }

    async fn kill_command(&self, _sandbox_id: &SandboxId, command_id: &str) -> Result<(), BackendError> {
        if let Some(kill) = self.commands.lock().await.remove(command_id) {
            let _ = kill.send(());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn sandbox(id: &str) -> SandboxId {
        SandboxId::parse(id).expect("sandbox")
    }

    fn org(id: &str) -> OrganizationId {
        OrganizationId::parse(id).expect("org")
    }

    #[tokio::test]
    async fn create_is_idempotent_for_the_owner() {
        let root = tempfile::tempdir().expect("tempdir");
        let control = LocalSandboxControl::new(root.path());
        let id = sandbox("sbx-1");

        assert_eq!(control.exists(&id).await.expect("exists"), None);
        control.create(&id, &org("acme")).await.expect("create");
        control.create(&id, &org("acme")).await.expect("create again");
        assert_eq!(control.exists(&id).await.expect("exists"), Some(org("acme")));

        assert_matches!(
            control.create(&id, &org("other")).await,
            Err(BackendError::SandboxNotFound(_))
        );
    }

    #[tokio::test]
    async fn files_round_trip_and_paths_cannot_escape() {
        let root = tempfile::tempdir().expect("tempdir");
        let control = LocalSandboxControl::new(root.path());
        let id = sandbox("sbx-1");
        control.create(&id, &org("acme")).await.expect("create");

        control
            .write_file(&id, "automations/acme/t1/script.js", b"v1")
            .await
            .expect("write");
        control
            .write_file(&id, "automations/acme/t1/script.js", b"v2")
            .await
            .expect("overwrite");
        assert_eq!(
            control
                .read_file(&id, "automations/acme/t1/script.js")
                .await
                .expect("read"),
            Some(b"v2".to_vec())
        );
        assert_eq!(control.read_file(&id, "missing.json").await.expect("read"), None);

        for bad in ["../escape", "/etc/passwd", "a/../../b", ""] {
            assert!(control.write_file(&id, bad, b"x").await.is_err(), "{bad} accepted");
        }
    }

    #[tokio::test]
    async fn writing_to_an_unknown_sandbox_fails() {
        let root = tempfile::tempdir().expect("tempdir");
        let control = LocalSandboxControl::new(root.path());
        assert_matches!(
            control.write_file(&sandbox("nope"), "a.txt", b"x").await,
            Err(BackendError::SandboxNotFound(_))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_commands_run_in_the_sandbox_and_can_be_killed() {
        let root = tempfile::tempdir().expect("tempdir");
        let control = LocalSandboxControl::new(root.path());
        let id = sandbox("sbx-1");
        control.create(&id, &org("acme")).await.expect("create");

        let write = SandboxCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "echo done > out.txt".into()],
            env: vec![],
        };
        control.run_command(&id, "cmd-write", &write).await.expect("run");
        let mut output = None;
        for _ in 0..50 {
            output = control.read_file(&id, "out.txt").await.expect("read");
            if output.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(output, Some(b"done\n".to_vec()));

        let sleeper = SandboxCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "while :; do :; done".into()],
            env: vec![],
        };
        control.run_command(&id, "cmd-spin", &sleeper).await.expect("run");
        control.kill_command(&id, "cmd-spin").await.expect("kill");
        for _ in 0..50 {
            if control.running_commands().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(control.running_commands().await, 0);
    }

    #[tokio::test]
    async fn command_ids_cannot_name_paths() {
        let root = tempfile::tempdir().expect("tempdir");
        let control = LocalSandboxControl::new(root.path());
        let id = sandbox("sbx-1");
        control.create(&id, &org("acme")).await.expect("create");
        let command = SandboxCommand {
            program: "/bin/true".into(),
            args: vec![],
            env: vec![],
        };
        assert_matches!(
            control.run_command(&id, "../escape", &command).await,
            Err(BackendError::Unavailable(_))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commands_past_their_lifetime_are_killed() {
        let root = tempfile::tempdir().expect("tempdir");
        let control = LocalSandboxControl::new(root.path())
            .with_max_command_duration(Duration::from_millis(100));
        let id = sandbox("sbx-1");
        control.create(&id, &org("acme")).await.expect("create");

        let spinner = SandboxCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "while :; do :; done".into()],
            env: vec![],
        };
        control.run_command(&id, "cmd-spin", &spinner).await.expect("run");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(control.running_commands().await, 0);
    }
}
