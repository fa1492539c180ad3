//! S3-compatible storage client
//!
//! Wraps the AWS SDK for MinIO, Cloudflare R2, Backblaze B2 and AWS S3.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use chrono::DateTime;

use crate::config::StorageConfig;
use crate::error::{Result, StorageError, VaultError};

use super::types::{ObjectMetadata, StorageObject};

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "sanchay-vault",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %bucket, "Connected to S3 bucket");
            }
            Err(e) => {
                tracing::warn!(
                    bucket = %bucket,
                    error = %e,
                    "Could not verify bucket, will attempt operations anyway"
                );
            }
        }

        Ok(Self { client, bucket })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Upload an object, replacing any existing object under the key
    pub async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(key, "put", DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    /// Get object metadata (HEAD request)
    pub async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, "head", DisplayErrorContext(&e).to_string()))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0),
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            etag: response.e_tag().map(|s| s.to_string()),
        })
    }

    /// Get an object's data
    pub async fn get_object(&self, key: &str) -> Result<StorageObject> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, "get", DisplayErrorContext(&e).to_string()))?;

        let metadata = ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0),
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            etag: response.e_tag().map(|s| s.to_string()),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::SdkError(format!("Failed to read object body: {}", e)))?
            .into_bytes()
            .to_vec();

        Ok(StorageObject { metadata, data })
    }

    /// Check if an object exists
    pub async fn object_exists(&self, key: &str) -> Result<bool> {
        match self.head_object(key).await {
            Ok(_) => Ok(true),
            Err(VaultError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete an object. Deleting a missing key is not an error in S3.
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, "delete", DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}

/// Map an SDK error message onto the engine's error taxonomy
fn classify(key: &str, op: &str, message: String) -> VaultError {
    if message.contains("404") || message.contains("NoSuchKey") || message.contains("NotFound") {
        VaultError::NotFound(key.to_string())
    } else if message.contains("403") || message.contains("AccessDenied") {
        StorageError::AccessDenied(format!("{} {}: {}", op, key, message)).into()
    } else if message.contains("dispatch failure") || message.contains("connect") {
        StorageError::ConnectionFailed(message).into()
    } else {
        StorageError::SdkError(format!("Failed to {} object {}: {}", op, key, message)).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = classify("ab/cd", "get", "service error: NoSuchKey".to_string());
        assert!(matches!(err, VaultError::NotFound(key) if key == "ab/cd"));
    }

    #[test]
    fn test_classify_access_denied() {
        let err = classify("ab/cd", "put", "status 403 AccessDenied".to_string());
        assert!(matches!(err, VaultError::Storage(StorageError::AccessDenied(_))));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_other() {
        let err = classify("ab/cd", "put", "throttled".to_string());
        assert!(matches!(err, VaultError::Storage(StorageError::SdkError(_))));
    }
}
