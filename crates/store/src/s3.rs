//! Amazon S3 blob store.
//!
//! Scripts live under an optional key prefix in a single bucket. A
//! `NoSuchKey` response is a miss; every other SDK failure is reported as
//! the store being unavailable so the tracker can retry it.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::blob::BlobStore;
use crate::error::StoreError;

const CONTENT_TYPE: &str = "application/javascript; charset=utf-8";

#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: normalize_prefix(prefix.into()),
        }
    }

    /// Build a client from the standard AWS configuration chain.
    pub async fn from_env(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), bucket, prefix)
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

fn normalize_prefix(prefix: String) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let object_key = self.object_key(key);
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    return Ok(None);
                }
                tracing::warn!(bucket = %self.bucket, key = %object_key, error = %err, "S3 get failed");
                return Err(StoreError::Unavailable(format!(
                    "get s3://{}/{object_key} failed",
                    self.bucket
                )));
            }
        };

        let bytes = output.body.collect().await.map_err(|e| {
            StoreError::Unavailable(format!("reading s3://{}/{object_key}: {e}", self.bucket))
        })?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let object_key = self.object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(CONTENT_TYPE)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(bucket = %self.bucket, key = %object_key, error = %err, "S3 put failed");
                StoreError::Unavailable(format!("put s3://{}/{object_key} failed", self.bucket))
            })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_normalized() {
        assert_eq!(normalize_prefix(String::new()), "");
        assert_eq!(normalize_prefix("/".into()), "");
        assert_eq!(normalize_prefix("scripts".into()), "scripts/");
        assert_eq!(normalize_prefix("/tenants/scripts/".into()), "tenants/scripts/");
    }
}
