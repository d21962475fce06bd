//! Storage keys for automation scripts.
//!
//! Every key is `{organizationId}/{taskId}{suffix}`. The suffix depends on
//! the [`ScriptSlot`]. Keys are only ever built from validated identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{OrganizationId, TaskId};

/// Key suffix of the published script a dispatch runs by default.
pub const PUBLISHED_SUFFIX: &str = ".js";

/// Key suffix of the working copy edited before publishing.
pub const DRAFT_SUFFIX: &str = ".automation.js";

/// Which copy of a task's script to address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptSlot {
    #[default]
    Published,
    Draft,
}

impl ScriptSlot {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Published => PUBLISHED_SUFFIX,
            Self::Draft => DRAFT_SUFFIX,
        }
    }
}

/// Fully qualified key of one script in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptKey(String);

impl ScriptKey {
    pub fn new(organization_id: &OrganizationId, task_id: &TaskId, slot: ScriptSlot) -> Self {
        Self(format!("{organization_id}/{task_id}{}", slot.suffix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
