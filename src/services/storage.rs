use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, BucketConfiguration, Region};
use std::future::Future;
use std::time::Duration;

use crate::models::job::ObjectRef;

/// Blob storage addressed by (bucket, key).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, object: &ObjectRef, data: &[u8], content_type: &str)
        -> Result<(), StorageError>;

    /// Fetch an object. Absent objects yield [`StorageError::NotFound`].
    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError>;

    /// Idempotent: deleting an absent key is not an error.
    async fn delete(&self, object: &ObjectRef) -> Result<(), StorageError>;

    /// Keys in `bucket` starting with `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Time-limited retrieval URL.
    async fn presigned_url(&self, object: &ObjectRef, expires: Duration)
        -> Result<String, StorageError>;
}

/// S3-compatible object storage client (MinIO, R2, AWS).
pub struct S3Storage {
    region: Region,
    credentials: Credentials,
    timeout: Duration,
}

impl S3Storage {
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
            timeout,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(bucket.with_path_style())
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, S3Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StorageError::from_s3),
            Err(_) => Err(StorageError::Timeout(self.timeout)),
        }
    }

    /// Create `name` if it does not exist yet.
    pub async fn ensure_bucket(&self, name: &str) -> Result<bool, StorageError> {
        let bucket = self.bucket(name)?;
        if self.timed(bucket.exists()).await? {
            return Ok(false);
        }

        let response = self
            .timed(Bucket::create_with_path_style(
                name,
                self.region.clone(),
                self.credentials.clone(),
                BucketConfiguration::default(),
            ))
            .await?;
        check_status(response.response_code, name)?;
        Ok(true)
    }
}

fn check_status(status: u16, key: &str) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        _ => Err(StorageError::Http {
            status,
            key: key.to_string(),
        }),
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn put(
        &self,
        object: &ObjectRef,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let bucket = self.bucket(&object.bucket)?;
        let response = self
            .timed(bucket.put_object_with_content_type(&object.key, data, content_type))
            .await?;
        check_status(response.status_code(), &object.key)
    }

    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        let bucket = self.bucket(&object.bucket)?;
        let response = self.timed(bucket.get_object(&object.key)).await?;
        check_status(response.status_code(), &object.key)?;
        Ok(response.to_vec())
    }

    async fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError> {
        let bucket = self.bucket(&object.bucket)?;
        match self.timed(bucket.head_object(&object.key)).await {
            Ok((_, status)) => match check_status(status, &object.key) {
                Ok(()) => Ok(true),
                Err(StorageError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            },
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), StorageError> {
        let bucket = self.bucket(&object.bucket)?;
        match self.timed(bucket.delete_object(&object.key)).await {
            Ok(response) => match check_status(response.status_code(), &object.key) {
                Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
            Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let handle = self.bucket(bucket)?;
        let pages = self.timed(handle.list(prefix.to_string(), None)).await?;
        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|object| object.key))
            .collect())
    }

    async fn presigned_url(
        &self,
        object: &ObjectRef,
        expires: Duration,
    ) -> Result<String, StorageError> {
        let bucket = self.bucket(&object.bucket)?;
        let secs = u32::try_from(expires.as_secs()).unwrap_or(u32::MAX);
        self.timed(bucket.presign_get(&object.key, secs, None)).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage returned HTTP {status} for {key}")]
    Http { status: u16, key: String },

    #[error("Storage request timed out after {0:?}")]
    Timeout(Duration),

    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    fn from_s3(err: S3Error) -> Self {
        match err {
            S3Error::HttpFailWithBody(404, body) => StorageError::NotFound(body),
            other => StorageError::S3(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(check_status(200, "k").is_ok());
        assert!(check_status(204, "k").is_ok());
        assert!(check_status(404, "k").unwrap_err().is_not_found());
        assert!(matches!(
            check_status(503, "k"),
            Err(StorageError::Http { status: 503, .. })
        ));
    }
}
