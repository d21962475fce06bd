//! Script store client.
//!
//! Resolves and saves automation scripts by `(organization, task, slot)`.
//! There is no cache: every dispatch re-reads the store, so a save followed
//! by a dispatch always runs what was just written.

use std::sync::Arc;

use evidence_core::script_key::{ScriptKey, ScriptSlot};
use evidence_core::types::{OrganizationId, TaskId};

use crate::blob::BlobStore;
use crate::error::StoreError;

/// A resolved script and the key it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    pub key: ScriptKey,
    pub source: String,
}

#[derive(Clone)]
pub struct ScriptStore {
    blobs: Arc<dyn BlobStore>,
}

impl ScriptStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Fetch the script for `task_id` owned by `organization_id`.
    pub async fn resolve(
        &self,
        organization_id: &OrganizationId,
        task_id: &TaskId,
        slot: ScriptSlot,
    ) -> Result<ScriptSource, StoreError> {
        let key = ScriptKey::new(organization_id, task_id, slot);
        let bytes = self
            .blobs
            .get(key.as_str())
            .await?
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;

        let source = String::from_utf8(bytes).map_err(|_| StoreError::InvalidEncoding {
            key: key.to_string(),
        })?;

        tracing::debug!(key = %key, bytes = source.len(), "Resolved automation script");
        Ok(ScriptSource { key, source })
    }

    /// Overwrite the script for `task_id`. Last write wins.
    pub async fn save(
        &self,
        organization_id: &OrganizationId,
        task_id: &TaskId,
        slot: ScriptSlot,
        source: &str,
    ) -> Result<ScriptKey, StoreError> {
        let key = ScriptKey::new(organization_id, task_id, slot);
        self.blobs
            .put(key.as_str(), source.as_bytes().to_vec())
            .await?;
        tracing::info!(key = %key, bytes = source.len(), "Saved automation script");
        Ok(key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::blob::MemoryBlobStore;

    struct DownStore;

    #[async_trait]
    impl BlobStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn ids(org: &str, task: &str) -> (OrganizationId, TaskId) {
        (
            OrganizationId::parse(org).expect("org"),
            TaskId::parse(task).expect("task"),
        )
    }

    #[tokio::test]
    async fn save_then_resolve_returns_latest() {
        let store = ScriptStore::new(Arc::new(MemoryBlobStore::new()));
        let (org, task) = ids("acme", "t1");

        store
            .save(&org, &task, ScriptSlot::Published, "v1")
            .await
            .expect("save");
        store
            .save(&org, &task, ScriptSlot::Published, "v2")
            .await
            .expect("save");

        let resolved = store
            .resolve(&org, &task, ScriptSlot::Published)
            .await
            .expect("resolve");
        assert_eq!(resolved.source, "v2");
        assert_eq!(resolved.key.as_str(), "acme/t1.js");
    }

    #[tokio::test]
    async fn slots_are_independent() {
        let store = ScriptStore::new(Arc::new(MemoryBlobStore::new()));
        let (org, task) = ids("acme", "t1");
        store
            .save(&org, &task, ScriptSlot::Draft, "draft")
            .await
            .expect("save");

        assert_matches!(
            store.resolve(&org, &task, ScriptSlot::Published).await,
            Err(StoreError::NotFound { .. })
        );
        let draft = store
            .resolve(&org, &task, ScriptSlot::Draft)
            .await
            .expect("draft");
        assert_eq!(draft.key.as_str(), "acme/t1.automation.js");
    }

    #[tokio::test]
    async fn organizations_do_not_share_scripts() {
        let store = ScriptStore::new(Arc::new(MemoryBlobStore::new()));
        let (org_a, task) = ids("org-a", "t1");
        let (org_b, _) = ids("org-b", "t1");
        store
            .save(&org_a, &task, ScriptSlot::Published, "a")
            .await
            .expect("save");

        assert_matches!(
            store.resolve(&org_b, &task, ScriptSlot::Published).await,
            Err(StoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn unavailable_is_distinct_from_missing() {
        let store = ScriptStore::new(Arc::new(DownStore));
        let (org, task) = ids("acme", "t1");
        let err = store
            .resolve(&org, &task, ScriptSlot::Published)
            .await
            .expect_err("store is down");
        assert_matches!(err, StoreError::Unavailable(_));
        assert!(err.kind().is_retryable());
    }

    #[tokio::test]
    async fn non_utf8_source_is_rejected() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .put("acme/t1.js", vec![0xff, 0xfe, 0x00])
            .await
            .expect("put");
        let store = ScriptStore::new(blobs);
        let (org, task) = ids("acme", "t1");
        assert_matches!(
            store.resolve(&org, &task, ScriptSlot::Published).await,
            Err(StoreError::InvalidEncoding { .. })
        );
    }
}
