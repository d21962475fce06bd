//! Key-value blob storage behind the script store client.
//!
//! Backends are thin adapters: they store and return opaque bytes and never
//! interpret keys beyond mapping them onto their own namespace. A missing key
//! is `Ok(None)`; only infrastructure faults are errors.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

/// Minimal `GET key` / `PUT key` contract of a blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local blob store for tests and development.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Local directory
// ---------------------------------------------------------------------------

/// Blob store rooted at a local directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|segment| segment.is_empty() || segment == "..")
        {
            return Err(StoreError::Unavailable(format!("refusing unsafe key '{key}'")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Unavailable(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Unavailable(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        // Readers never observe a half-written script.
        write_replacing(&path, &bytes).await.map_err(|e| {
            StoreError::Unavailable(format!("failed to write {}: {e}", path.display()))
        })?;
        Ok(())
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
///
/// Every call gets its own temp name, so concurrent writers of one path never
/// rename each other's files away; the last rename wins.
pub(crate) async fn write_replacing(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn memory_store_get_put() {
        let store = MemoryBlobStore::new();
        assert!(store.get("acme/t1.js").await.expect("get").is_none());
        store
            .put("acme/t1.js", b"one".to_vec())
            .await
            .expect("put");
        store
            .put("acme/t1.js", b"two".to_vec())
            .await
            .expect("put");
        assert_eq!(
            store.get("acme/t1.js").await.expect("get"),
            Some(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn local_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path());

        assert!(store.get("acme/t1.js").await.expect("get").is_none());
        store
            .put("acme/t1.js", b"module.exports = () => 1;".to_vec())
            .await
            .expect("put");

        let bytes = store.get("acme/t1.js").await.expect("get").expect("present");
        assert_eq!(bytes, b"module.exports = () => 1;");
        assert!(dir.path().join("acme").join("t1.js").exists());
        let entries = std::fs::read_dir(dir.path().join("acme")).expect("read_dir").count();
        assert_eq!(entries, 1, "no temp files left behind");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_of_one_key_all_succeed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = std::sync::Arc::new(LocalBlobStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let body = format!("module.exports = () => {i};");
                store.put("acme/t1.js", body.into_bytes()).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("put");
        }

        let bytes = store.get("acme/t1.js").await.expect("get").expect("present");
        let body = String::from_utf8(bytes).expect("utf8");
        assert!(body.starts_with("module.exports = () => "));
        let entries = std::fs::read_dir(dir.path().join("acme")).expect("read_dir").count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn local_store_rejects_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path());
        assert_matches!(
            store.get("../outside.js").await,
            Err(StoreError::Unavailable(_))
        );
        assert_matches!(
            store.put("/abs.js", Vec::new()).await,
            Err(StoreError::Unavailable(_))
        );
    }
}
