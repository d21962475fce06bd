//! Per-organization secrets and the organization-bound resolver.
//!
//! A [`SecretResolver`] is constructed with exactly one organization id and
//! can only ever read that organization's bundle. A missing name is not an
//! error, it resolves to `None`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use evidence_core::types::OrganizationId;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;

use crate::error::SecretError;

/// A single secret value. `Debug` and `Display` never print the value.
#[derive(Clone)]
pub struct SecretValue {
    inner: SecretString,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: SecretString::from(value.into()),
        }
    }

    /// Reveal the value. Only the capability injection point calls this.
    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// All secrets of one organization, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SecretBundle {
    values: HashMap<String, SecretValue>,
}

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SecretValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretBundle {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let values = iter
            .into_iter()
            .map(|(k, v)| (k.into(), SecretValue::new(v)))
            .collect();
        Self { values }
    }
}

/// Source of per-organization secret bundles.
///
/// An organization with no bundle yields an empty one.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn bundle(&self, organization_id: &OrganizationId) -> Result<SecretBundle, SecretError>;
}

/// In-memory [`SecretStore`] for tests and development.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    bundles: RwLock<HashMap<OrganizationId, SecretBundle>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(
        &self,
        organization_id: &OrganizationId,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.bundles
            .write()
            .await
            .entry(organization_id.clone())
            .or_default()
            .insert(name, SecretValue::new(value));
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn bundle(&self, organization_id: &OrganizationId) -> Result<SecretBundle, SecretError> {
        Ok(self
            .bundles
            .read()
            .await
            .get(organization_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Resolves secret names for one organization only.
#[derive(Clone)]
pub struct SecretResolver {
    store: Arc<dyn SecretStore>,
    organization_id: OrganizationId,
}

impl SecretResolver {
    pub fn new(store: Arc<dyn SecretStore>, organization_id: OrganizationId) -> Self {
        Self {
            store,
            organization_id,
        }
    }

    pub fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    /// Look up `name` in the bound organization's bundle.
    pub async fn resolve(&self, name: &str) -> Result<Option<SecretValue>, SecretError> {
        let bundle = self.store.bundle(&self.organization_id).await?;
        let value = bundle.get(name).cloned();
        tracing::debug!(
            organization_id = %self.organization_id,
            secret = name,
            found = value.is_some(),
            "Resolved secret"
        );
        Ok(value)
    }
}

impl fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretResolver")
            .field("organization_id", &self.organization_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn org(id: &str) -> OrganizationId {
        OrganizationId::parse(id).expect("org")
    }

    #[test]
    fn secret_value_is_redacted() {
        let value = SecretValue::new("hunter2");
        assert_eq!(format!("{value:?}"), "[REDACTED]");
        assert_eq!(value.to_string(), "[REDACTED]");
        assert_eq!(value.expose(), "hunter2");
    }

    #[tokio::test]
    async fn resolves_present_and_missing_names() {
        let store = Arc::new(MemorySecretStore::new());
        store.set(&org("acme"), "API_TOKEN", "abc").await;

        let resolver = SecretResolver::new(store, org("acme"));
        let token = resolver.resolve("API_TOKEN").await.expect("resolve");
        assert_eq!(token.map(|v| v.expose().to_string()), Some("abc".into()));
        assert!(resolver.resolve("MISSING").await.expect("resolve").is_none());
    }

    #[tokio::test]
    async fn resolver_cannot_see_other_organizations() {
        let store = Arc::new(MemorySecretStore::new());
        store.set(&org("org-a"), "KEY", "alpha").await;
        store.set(&org("org-b"), "KEY", "bravo").await;

        let resolver_a = SecretResolver::new(store.clone(), org("org-a"));
        let resolver_c = SecretResolver::new(store, org("org-c"));

        let a = resolver_a.resolve("KEY").await.expect("resolve").expect("present");
        assert_eq!(a.expose(), "alpha");
        assert!(resolver_c.resolve("KEY").await.expect("resolve").is_none());
    }

    #[test]
    fn bundle_from_pairs() {
        let bundle: SecretBundle = [("A", "1"), ("B", "2")].into_iter().collect();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get("B").map(SecretValue::expose), Some("2"));
        assert!(!bundle.is_empty());
    }
}
