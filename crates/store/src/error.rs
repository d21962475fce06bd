use evidence_core::execution::ErrorKind;

/// Failures of the script store client and its blob backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No script stored at {key}")]
    NotFound { key: String },

    #[error("Script store unavailable: {0}")]
    Unavailable(String),

    #[error("Script at {key} is not valid UTF-8")]
    InvalidEncoding { key: String },
}

impl StoreError {
    /// Execution error kind reported for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unavailable(_) => ErrorKind::StoreUnavailable,
            Self::InvalidEncoding { .. } => ErrorKind::CompileError,
        }
    }
}

/// Failures of the secret stores.
///
/// None of these ever carry a secret value in their message.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid sealing key: {0}")]
    InvalidKey(String),

    #[error("Secret bundle for {organization_id} could not be decrypted")]
    Decrypt { organization_id: String },

    #[error("Malformed secret bundle: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_kinds() {
        assert_eq!(
            StoreError::NotFound { key: "a/b.js".into() }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            StoreError::Unavailable("timeout".into()).kind(),
            ErrorKind::StoreUnavailable
        );
        assert_eq!(
            StoreError::InvalidEncoding { key: "a/b.js".into() }.kind(),
            ErrorKind::CompileError
        );
    }

    #[test]
    fn display_messages() {
        let err = StoreError::NotFound { key: "acme/t1.js".into() };
        assert_eq!(err.to_string(), "No script stored at acme/t1.js");

        let err = SecretError::Decrypt { organization_id: "acme".into() };
        assert_eq!(
            err.to_string(),
            "Secret bundle for acme could not be decrypted"
        );
    }
}
