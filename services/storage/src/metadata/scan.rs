use super::MetadataStore;
use crate::blob_store::BlobStore;
use crate::error::{ImageError, Result};
use crate::layout::{id_from_key, metadata_key, METADATA_PREFIX};
use crate::model::{DerivedArtifact, ImageRecord};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

/// Concurrent document reads during a scan
const SCAN_CONCURRENCY: usize = 16;

/// Per-id locks for read-modify-write of a document.
/// Entries nobody holds are pruned on the next acquisition.
#[derive(Default)]
struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Metadata kept as one JSON document per image on the blob backend
pub struct ScanMetadataStore {
    blobs: Arc<dyn BlobStore>,
    locks: RecordLocks,
}

impl ScanMetadataStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            locks: RecordLocks::default(),
        }
    }

    async fn read(&self, id: &str) -> Result<ImageRecord> {
        let data = self.blobs.get(&metadata_key(id)).await.map_err(|e| {
            if e.is_not_found() {
                ImageError::NotFound(format!("image {id}"))
            } else {
                e.into()
            }
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn write(&self, record: &ImageRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        self.blobs
            .put(&metadata_key(&record.id), Bytes::from(json))
            .await?;
        Ok(())
    }

    /// Load every record, newest first. Unreadable documents are skipped.
    #[instrument(skip(self))]
    async fn scan(&self) -> Result<Vec<ImageRecord>> {
        let prefix = format!("{METADATA_PREFIX}/");
        let entries = self.blobs.list(&prefix).await?;

        let ids: Vec<String> = entries
            .iter()
            .filter(|e| e.key.ends_with(".json"))
            .filter_map(|e| id_from_key(&e.key).map(String::from))
            .collect();

        let records: Vec<Option<ImageRecord>> = stream::iter(ids)
            .map(|id| async move {
                match self.read(&id).await {
                    Ok(record) => Ok(Some(record)),
                    // Deleted between list and read
                    Err(ImageError::NotFound(_)) => Ok(None),
                    Err(ImageError::Internal(msg)) => {
                        warn!(id = %id, error = %msg, "Skipping unreadable metadata document");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(SCAN_CONCURRENCY)
            .try_collect()
            .await?;

        let mut records: Vec<ImageRecord> = records.into_iter().flatten().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        debug!(count = records.len(), "Scanned metadata documents");
        Ok(records)
    }
}

#[async_trait]
impl MetadataStore for ScanMetadataStore {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn is_indexed(&self) -> bool {
        false
    }

    async fn put_metadata(&self, record: &ImageRecord) -> Result<()> {
        let _guard = self.locks.lock(&record.id).await;
        self.write(record).await
    }

    async fn get_metadata(&self, id: &str) -> Result<ImageRecord> {
        self.read(id).await
    }

    async fn attach_derived(&self, id: &str, artifacts: &[DerivedArtifact]) -> Result<()> {
        // Held across read and write so a concurrent delete cannot be undone
        let _guard = self.locks.lock(id).await;
        let mut record = self.read(id).await?;
        for artifact in artifacts {
            record.attach(artifact.rendition, artifact.path.clone(), artifact.size);
        }
        self.write(&record).await
    }

    async fn delete_metadata(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        Ok(self.blobs.delete(&metadata_key(id)).await?)
    }

    async fn list_ids_by_tags(
        &self,
        required: &[String],
        excluded: &[String],
    ) -> Result<Vec<String>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|r| r.matches_tags(required, excluded))
            .map(|r| r.id)
            .collect())
    }

    async fn list_all_ids(&self) -> Result<Vec<String>> {
        Ok(self.scan().await?.into_iter().map(|r| r.id).collect())
    }

    async fn all_unique_tags(&self) -> Result<Vec<String>> {
        let tags: BTreeSet<String> = self
            .scan()
            .await?
            .into_iter()
            .flat_map(|r| r.tags.into_iter())
            .collect();
        Ok(tags.into_iter().collect())
    }

    async fn expired_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;
    use crate::model::{normalize_tags, Orientation, Rendition, SourceFormat};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn record(id: &str, tags: &[&str], minutes: i64) -> ImageRecord {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap() + Duration::minutes(minutes);
        let mut record = ImageRecord {
            id: id.to_string(),
            original_format: SourceFormat::Jpeg,
            orientation: Orientation::Landscape,
            width: 1920,
            height: 1080,
            tags: normalize_tags(tags.iter().copied()),
            expiry_at: None,
            paths: BTreeMap::new(),
            sizes: BTreeMap::new(),
            created_at: created,
        };
        record.attach(Rendition::Original, format!("original/landscape/{id}.jpg"), 3);
        record
    }

    async fn store() -> (tempfile::TempDir, ScanMetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path(), std::time::Duration::from_secs(5))
            .await
            .unwrap();
        (dir, ScanMetadataStore::new(Arc::new(blobs)))
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_dir, store) = store().await;
        let rec = record("a", &["nature"], 0);
        store.put_metadata(&rec).await.unwrap();

        assert_eq!(store.get_metadata("a").await.unwrap(), rec);
        assert!(store.delete_metadata("a").await.unwrap());
        assert!(!store.delete_metadata("a").await.unwrap());
        assert!(store.get_metadata("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tag_queries() {
        let (_dir, store) = store().await;
        store.put_metadata(&record("cat-1", &["cat"], 0)).await.unwrap();
        store.put_metadata(&record("dog-1", &["dog"], 1)).await.unwrap();
        store.put_metadata(&record("both", &["cat", "dog"], 2)).await.unwrap();

        assert_eq!(
            store.list_ids_by_tags(&strings(&["cat"]), &[]).await.unwrap(),
            strings(&["both", "cat-1"])
        );
        assert_eq!(
            store
                .list_ids_by_tags(&strings(&["cat"]), &strings(&["dog"]))
                .await
                .unwrap(),
            strings(&["cat-1"])
        );
        assert_eq!(
            store.list_ids_by_tags(&[], &strings(&["cat"])).await.unwrap(),
            strings(&["dog-1"])
        );
        assert_eq!(
            store.list_all_ids().await.unwrap(),
            strings(&["both", "dog-1", "cat-1"])
        );
        assert_eq!(store.all_unique_tags().await.unwrap(), strings(&["cat", "dog"]));
    }

    #[tokio::test]
    async fn test_attach_derived_keeps_other_fields() {
        let (_dir, store) = store().await;
        store.put_metadata(&record("a", &["x"], 0)).await.unwrap();

        let artifacts = vec![DerivedArtifact {
            rendition: Rendition::Webp,
            path: "landscape/webp/a.webp".to_string(),
            size: 2,
        }];
        store.attach_derived("a", &artifacts).await.unwrap();

        let updated = store.get_metadata("a").await.unwrap();
        assert_eq!(updated.path(Rendition::Webp), Some("landscape/webp/a.webp"));
        assert_eq!(updated.sizes.get(&Rendition::Webp), Some(&2));
        assert!(updated.has(Rendition::Original));
        assert!(updated.has_tag("x"));

        assert!(store
            .attach_derived("missing", &artifacts)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_expired_ids() {
        let (_dir, store) = store().await;
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();

        let mut expired = record("old", &[], 0);
        expired.expiry_at = Some(now - Duration::minutes(1));
        let mut pending = record("new", &[], 0);
        pending.expiry_at = Some(now + Duration::minutes(1));
        let forever = record("forever", &[], 0);

        for r in [&expired, &pending, &forever] {
            store.put_metadata(r).await.unwrap();
        }

        assert_eq!(store.expired_ids(now).await.unwrap(), strings(&["old"]));
    }
}
