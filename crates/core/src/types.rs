//! Identifier newtypes and shared aliases.
//!
//! Organization, task, and sandbox identifiers are validated on
//! construction, so every storage key or sandbox path built from them is
//! free of separators, traversal segments, and empty components.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Maximum length of an organization, task, or sandbox identifier.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Prefix of every generated run handle.
const RUN_ID_PREFIX: &str = "run_";

/// Validate that `value` is 1..=128 chars of `[A-Za-z0-9_-]`.
pub fn validate_identifier(entity: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::Validation(format!("{entity} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::Validation(format!(
            "{entity} must be at most {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(CoreError::Validation(format!(
            "{entity} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

macro_rules! define_identifier {
    (
        $(#[$meta:meta])*
        $name:ident => $entity:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw identifier.
            pub fn parse(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into();
                validate_identifier($entity, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_identifier! {
    /// Tenant that owns scripts, secrets, sandboxes, and runs.
    OrganizationId => "organization id"
}

define_identifier! {
    /// Compliance task an automation script belongs to.
    TaskId => "task id"
}

define_identifier! {
    /// Provider-issued identifier of an interactive sandbox.
    SandboxId => "sandbox id"
}

/// Opaque run handle returned at dispatch time (`run_<32 hex>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh, globally unique handle.
    pub fn generate() -> Self {
        Self(format!("{RUN_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Parse a handle previously issued by [`RunId::generate`].
    pub fn parse(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        let well_formed = value
            .strip_prefix(RUN_ID_PREFIX)
            .is_some_and(|hex| hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()));
        if !well_formed {
            return Err(CoreError::Validation(format!("malformed run id '{value}'")));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
