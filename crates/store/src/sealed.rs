//! Encrypted on-disk secret bundles.
//!
//! Each organization's bundle lives at `{dir}/{organization_id}.json` as an
//! AES-256-GCM envelope. The organization id is bound in as associated data,
//! so a bundle file copied under another organization's name fails to open.
//!
//! ```json
//! { "version": 1, "nonce": "<base64>", "ciphertext": "<base64>" }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use evidence_core::types::OrganizationId;
use serde::{Deserialize, Serialize};

use crate::blob::write_replacing;
use crate::error::SecretError;
use crate::secrets::{SecretBundle, SecretStore};

/// Current envelope format version.
const ENVELOPE_VERSION: u32 = 1;

/// Nonce length for AES-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// 256-bit key used to seal and open bundles.
#[derive(Clone)]
pub struct SealingKey([u8; 32]);

impl SealingKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, SecretError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SecretError::InvalidKey(format!("not base64: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| SecretError::InvalidKey(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealingKey([REDACTED])")
    }
}

/// Serialized form of a sealed bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBundle {
    pub version: u32,
    pub nonce: String,
    pub ciphertext: String,
}

fn associated_data(organization_id: &OrganizationId) -> Vec<u8> {
    format!("evidence-secrets:v{ENVELOPE_VERSION}:{organization_id}").into_bytes()
}

/// Encrypt `values` for `organization_id`.
pub fn seal(
    key: &SealingKey,
    organization_id: &OrganizationId,
    values: &BTreeMap<String, String>,
) -> Result<SealedBundle, SecretError> {
    let plaintext =
        serde_json::to_vec(values).map_err(|e| SecretError::Malformed(e.to_string()))?;
    let aad = associated_data(organization_id);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(
            &nonce,
            Payload {
                msg: &plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| SecretError::Malformed("encryption failed".into()))?;

    Ok(SealedBundle {
        version: ENVELOPE_VERSION,
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Decrypt a sealed bundle that belongs to `organization_id`.
pub fn open(
    key: &SealingKey,
    organization_id: &OrganizationId,
    sealed: &SealedBundle,
) -> Result<SecretBundle, SecretError> {
    if sealed.version != ENVELOPE_VERSION {
        return Err(SecretError::Malformed(format!(
            "unsupported envelope version {}",
            sealed.version
        )));
    }
    let nonce_bytes = BASE64
        .decode(&sealed.nonce)
        .map_err(|e| SecretError::Malformed(format!("nonce: {e}")))?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(SecretError::Malformed("nonce length mismatch".into()));
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .map_err(|e| SecretError::Malformed(format!("ciphertext: {e}")))?;

    let aad = associated_data(organization_id);
    let plaintext = key
        .cipher()
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| SecretError::Decrypt {
            organization_id: organization_id.to_string(),
        })?;

    let values: BTreeMap<String, String> =
        serde_json::from_slice(&plaintext).map_err(|e| SecretError::Malformed(e.to_string()))?;
    Ok(values.into_iter().collect())
}

/// [`SecretStore`] over a directory of sealed bundle files.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
    key: SealingKey,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>, key: SealingKey) -> Self {
        Self {
            dir: dir.into(),
            key,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, organization_id: &OrganizationId) -> PathBuf {
        self.dir.join(format!("{organization_id}.json"))
    }

    /// Seal `values` and replace the organization's bundle file.
    pub async fn write_bundle(
        &self,
        organization_id: &OrganizationId,
        values: &BTreeMap<String, String>,
    ) -> Result<(), SecretError> {
        let sealed = seal(&self.key, organization_id, values)?;
        let json =
            serde_json::to_vec_pretty(&sealed).map_err(|e| SecretError::Malformed(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SecretError::Unavailable(e.to_string()))?;
        write_replacing(&self.path_for(organization_id), &json)
            .await
            .map_err(|e| SecretError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn bundle(&self, organization_id: &OrganizationId) -> Result<SecretBundle, SecretError> {
        let path = self.path_for(organization_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(SecretBundle::new()),
            Err(e) => {
                return Err(SecretError::Unavailable(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        let sealed: SealedBundle =
            serde_json::from_slice(&bytes).map_err(|e| SecretError::Malformed(e.to_string()))?;
        open(&self.key, organization_id, &sealed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
