use evidence_core::execution::ErrorKind;
use evidence_core::types::SandboxId;
use evidence_store::StoreError;

/// Infrastructure failures raised by a sandbox backend.
///
/// Script-level failures never appear here; those are carried in the
/// [`ExecutionReport`](evidence_core::execution::ExecutionReport).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(SandboxId),
}

impl BackendError {
    /// Classification recorded on the run when this error is final.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Unavailable(_) => ErrorKind::SandboxUnavailable,
            Self::SandboxNotFound(_) => ErrorKind::NotFound,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
