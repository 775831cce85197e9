use crate::blob_store::StorageError;
use thiserror::Error;

/// Errors surfaced by the image core to its callers
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Partial failure: {deleted} blobs deleted, {failed} failed")]
    PartialFailure { deleted: usize, failed: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

impl From<StorageError> for ImageError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => Self::NotFound(key),
            StorageError::InvalidKey(key) => Self::InvalidInput(format!("invalid key: {key}")),
            StorageError::Unavailable(msg) | StorageError::Timeout(msg) => {
                Self::BackendUnavailable(msg)
            }
            StorageError::Io(e) => Self::Internal(e.to_string()),
            StorageError::Backend(msg) => Self::Internal(msg),
        }
    }
}

impl From<redis::RedisError> for ImageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::BackendUnavailable(format!("redis: {err}"))
        } else {
            Self::Internal(format!("redis: {err}"))
        }
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("metadata encoding: {err}"))
    }
}

pub type Result<T, E = ImageError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        assert!(ImageError::from(StorageError::NotFound("k".into())).is_not_found());
        assert!(ImageError::from(StorageError::Unavailable("down".into())).is_unavailable());
        assert!(ImageError::from(StorageError::Timeout("slow".into())).is_unavailable());
        assert!(matches!(
            ImageError::from(StorageError::Backend("boom".into())),
            ImageError::Internal(_)
        ));
    }

    #[test]
    fn test_partial_failure_message() {
        let err = ImageError::PartialFailure { deleted: 2, failed: 1 };
        assert_eq!(err.to_string(), "Partial failure: 2 blobs deleted, 1 failed");
    }
}
