//! Tenant-partitioned storage used by the automation runner.
//!
//! - [`script_store`]: the script store client over a [`blob::BlobStore`].
//! - [`secrets`]: per-organization secret bundles and the
//!   organization-bound [`secrets::SecretResolver`].

pub mod blob;
pub mod error;
pub mod s3;
pub mod script_store;
pub mod sealed;
pub mod secrets;

pub use blob::{BlobStore, LocalBlobStore, MemoryBlobStore};
pub use error::{SecretError, StoreError};
pub use script_store::{ScriptSource, ScriptStore};
pub use secrets::{SecretResolver, SecretStore, SecretValue};
