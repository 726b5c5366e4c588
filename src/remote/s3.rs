//! S3-compatible blob store adapter (S3, R2, MinIO).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use super::BlobStore;
use crate::error::{OutboxError, Result};

/// Blob store backed by an S3-compatible bucket.
///
/// Keys passed to [`BlobStore::put`] are used verbatim under the bucket,
/// after an optional root prefix from the URI. S3 `PutObject` overwrites
/// existing keys, which gives the idempotency the retry policy relies on.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3BlobStore {
    /// Create from an S3 URI: `s3://bucket` or `s3://bucket/prefix`.
    ///
    /// AWS credentials and region are loaded from the environment.
    pub async fn from_uri(uri: &str) -> Result<Self> {
        let (bucket, prefix) = parse_uri(uri)?;

        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let client = S3Client::new(&config);

        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let full_key = self.full_key(key);
        let size = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| OutboxError::BlobStore(e.to_string()))?;

        tracing::debug!(
            "Uploaded {} bytes to s3://{}/{}",
            size,
            self.bucket,
            full_key
        );
        Ok(())
    }
}

fn parse_uri(uri: &str) -> Result<(String, Option<String>)> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| OutboxError::Config("URI must start with s3://".to_string()))?;

    let (bucket, prefix) = match rest.split_once('/') {
        Some((bucket, p)) => {
            let p = p.trim_matches('/');
            let prefix = if p.is_empty() {
                None
            } else {
                Some(p.to_string())
            };
            (bucket.to_string(), prefix)
        }
        None => (rest.to_string(), None),
    };
    if bucket.is_empty() {
        return Err(OutboxError::Config(
            "URI must name a bucket: s3://bucket[/prefix]".to_string(),
        ));
    }
    Ok((bucket, prefix))
}
