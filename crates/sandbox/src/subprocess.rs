//! Child-process plumbing for the runner binary.
//!
//! [`run_process`] spawns a prepared [`Command`], writes the request to its
//! stdin, captures stdout and stderr and enforces a wall-clock timeout. The
//! single-invocation backend runs `evidence-runner --stdin` through it in
//! child-process mode.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// What to feed a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessInput {
    /// Bytes written to stdin before it is closed.
    pub stdin: Vec<u8>,
    /// Environment variables set for the child, on top of a cleared
    /// environment.
    pub env: Vec<(String, String)>,
    /// Wall-clock budget before the child is killed.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` if the child was killed by a signal.
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Spawn `cmd`, pipe `input.stdin` into it and wait for it to exit.
///
/// The child's environment is cleared so no host secrets leak into it; only
/// `input.env` is passed through.
pub async fn run_process(cmd: &mut Command, input: ProcessInput) -> Result<ProcessOutput, ProcessError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .kill_on_drop(true);

    for (key, value) in &input.env {
        cmd.env(key, value);
    }

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|source| ProcessError::Spawn { program, source })?;

    if let Some(mut stdin) = child.stdin.take() {
        // The child may exit before reading everything.
        let _ = stdin.write_all(&input.stdin).await;
        drop(stdin);
    }

    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    match tokio::time::timeout(input.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(ProcessOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code: status.code().unwrap_or(-1),
                duration_ms: start.elapsed().as_millis() as u64,
            })
        }
        Ok(Err(e)) => Err(ProcessError::Io(e)),
        // `child` is dropped here and killed via `kill_on_drop`.
        Err(_) => Err(ProcessError::Timeout {
            elapsed_ms: start.elapsed().as_millis() as u64,
        }),
    }
}

/// Read a stream to the end, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
