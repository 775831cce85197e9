//! Per-image metadata plus the tag, recency and expiry indexes.
//!
//! Two backends share one contract:
//!
//! - [`RedisMetadataStore`]: a hash per image, a sorted set for recency, a
//!   sorted set of expiring ids and a set per tag. Index maintenance runs as
//!   server-side scripts so concurrent writers never interleave.
//! - [`ScanMetadataStore`]: one JSON document per image on the blob backend.
//!   Every query is a full scan.
//!
//! [`IndexedMetadataStore`] composes the two: the scan store is always
//! written, the index is preferred for reads and skipped when unreachable.

pub mod indexed;
pub mod redis;
pub mod scan;

pub use self::indexed::IndexedMetadataStore;
pub use self::redis::RedisMetadataStore;
pub use self::scan::ScanMetadataStore;

use crate::error::Result;
use crate::model::{DerivedArtifact, ImageRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Whether tag queries are answered from an index instead of a scan
    fn is_indexed(&self) -> bool;

    /// Write or overwrite a record and its index memberships
    async fn put_metadata(&self, record: &ImageRecord) -> Result<()>;

    /// `ImageError::NotFound` if the id is unknown
    async fn get_metadata(&self, id: &str) -> Result<ImageRecord>;

    /// Add derived renditions to an existing record without touching other fields.
    /// `ImageError::NotFound` if the record is gone.
    async fn attach_derived(&self, id: &str, artifacts: &[DerivedArtifact]) -> Result<()>;

    /// Remove a record and all its index memberships. Returns whether it existed.
    async fn delete_metadata(&self, id: &str) -> Result<bool>;

    /// Ids carrying every tag in `required` and none in `excluded`.
    /// An empty `required` means every id.
    async fn list_ids_by_tags(&self, required: &[String], excluded: &[String])
        -> Result<Vec<String>>;

    /// Every id, newest first where the backend can order
    async fn list_all_ids(&self) -> Result<Vec<String>>;

    /// Sorted, deduplicated tags in use
    async fn all_unique_tags(&self) -> Result<Vec<String>>;

    /// Ids whose expiry is at or before `now`
    async fn expired_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
}
