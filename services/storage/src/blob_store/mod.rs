//! Uniform byte-blob storage over slash-delimited keys.

pub mod local;
pub mod s3;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("Storage operation timed out: {0}")]
    Timeout(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A listed blob with its size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Store bytes under `key`, overwriting any previous blob
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Fetch a blob, `StorageError::NotFound` if absent
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Delete a blob. Returns whether it existed; a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete several blobs, reporting the outcome per key
    async fn delete_many(&self, keys: &[String]) -> Vec<(String, Result<bool, StorageError>)> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self.delete(key).await;
            results.push((key.clone(), result));
        }
        results
    }

    /// Every blob whose key starts with `prefix`, with sizes
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Reject keys that could escape the storage root
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");

    if bad {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

/// Run a storage operation under a deadline
pub(crate) async fn bounded<T, F>(limit: Duration, op: &str, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(format!("{op} exceeded {:?}", limit))),
    }
}
