use super::MetadataStore;
use crate::error::{ImageError, Result};
use crate::model::{DerivedArtifact, ImageRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Scan store as the durable record, optional key-value index in front of it.
///
/// Writes always reach the scan store; index writes are best-effort.
/// Reads use the index when configured and degrade to the scan store while
/// the index is unreachable. There is no reconciliation between the two.
pub struct IndexedMetadataStore {
    index: Option<Arc<dyn MetadataStore>>,
    scan: Arc<dyn MetadataStore>,
}

impl IndexedMetadataStore {
    pub fn new(index: Option<Arc<dyn MetadataStore>>, scan: Arc<dyn MetadataStore>) -> Self {
        Self { index, scan }
    }

    /// Scan-only operating mode
    pub fn scan_only(scan: Arc<dyn MetadataStore>) -> Self {
        Self::new(None, scan)
    }

    fn degrade(&self, op: &str, err: &ImageError) {
        metrics::counter!("imgpool.metadata.fallback_reads").increment(1);
        warn!(op = op, error = %err, "Metadata index unavailable, falling back to scan");
    }
}

#[async_trait]
impl MetadataStore for IndexedMetadataStore {
    fn name(&self) -> &'static str {
        match self.index {
            Some(_) => "indexed",
            None => "scan",
        }
    }

    fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    async fn put_metadata(&self, record: &ImageRecord) -> Result<()> {
        self.scan.put_metadata(record).await?;

        if let Some(index) = &self.index {
            if let Err(e) = index.put_metadata(record).await {
                metrics::counter!("imgpool.metadata.index_write_failures").increment(1);
                warn!(id = %record.id, error = %e, "Failed to index record");
            }
        }
        Ok(())
    }

    async fn get_metadata(&self, id: &str) -> Result<ImageRecord> {
        if let Some(index) = &self.index {
            match index.get_metadata(id).await {
                Ok(record) => return Ok(record),
                // A best-effort index write may have been lost
                Err(ImageError::NotFound(_)) => {}
                Err(e) if e.is_unavailable() => self.degrade("get", &e),
                Err(e) => return Err(e),
            }
        }
        self.scan.get_metadata(id).await
    }

    async fn attach_derived(&self, id: &str, artifacts: &[DerivedArtifact]) -> Result<()> {
        self.scan.attach_derived(id, artifacts).await?;

        if let Some(index) = &self.index {
            match index.attach_derived(id, artifacts).await {
                Ok(()) => {}
                Err(ImageError::NotFound(_)) => {
                    warn!(id = %id, "Record missing from index, derived formats not indexed");
                }
                Err(e) => {
                    metrics::counter!("imgpool.metadata.index_write_failures").increment(1);
                    warn!(id = %id, error = %e, "Failed to index derived formats");
                }
            }
        }
        Ok(())
    }

    async fn delete_metadata(&self, id: &str) -> Result<bool> {
        let existed = self.scan.delete_metadata(id).await?;

        // A stale index entry would keep serving the id, so this error propagates
        if let Some(index) = &self.index {
            let indexed = index.delete_metadata(id).await?;
            return Ok(existed || indexed);
        }
        Ok(existed)
    }

    async fn list_ids_by_tags(
        &self,
        required: &[String],
        excluded: &[String],
    ) -> Result<Vec<String>> {
        if let Some(index) = &self.index {
            match index.list_ids_by_tags(required, excluded).await {
                Ok(ids) => return Ok(ids),
                Err(e) if e.is_unavailable() => self.degrade("list_ids_by_tags", &e),
                Err(e) => return Err(e),
            }
        }
        self.scan.list_ids_by_tags(required, excluded).await
    }

    async fn list_all_ids(&self) -> Result<Vec<String>> {
        if let Some(index) = &self.index {
            match index.list_all_ids().await {
                Ok(ids) => return Ok(ids),
                Err(e) if e.is_unavailable() => self.degrade("list_all_ids", &e),
                Err(e) => return Err(e),
            }
        }
        self.scan.list_all_ids().await
    }

    async fn all_unique_tags(&self) -> Result<Vec<String>> {
        if let Some(index) = &self.index {
            match index.all_unique_tags().await {
                Ok(tags) => return Ok(tags),
                Err(e) if e.is_unavailable() => self.degrade("all_unique_tags", &e),
                Err(e) => return Err(e),
            }
        }
        self.scan.all_unique_tags().await
    }

    /// Union of both stores: a record whose index write was lost still
    /// expires, and a stale index entry is still offered for removal.
    async fn expired_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut ids = self.scan.expired_ids(now).await?;

        if let Some(index) = &self.index {
            match index.expired_ids(now).await {
                Ok(indexed) => {
                    let known: HashSet<String> = ids.iter().cloned().collect();
                    ids.extend(indexed.into_iter().filter(|id| !known.contains(id)));
                }
                Err(e) if e.is_unavailable() => self.degrade("expired_ids", &e),
                Err(e) => return Err(e),
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;
    use crate::metadata::ScanMetadataStore;
    use crate::model::{Orientation, SourceFormat};
    use chrono::TimeZone;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Index that is permanently unreachable
    #[derive(Default)]
    struct DownIndex {
        calls: AtomicUsize,
    }

    impl DownIndex {
        fn fail<T>(&self) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ImageError::BackendUnavailable("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl MetadataStore for DownIndex {
        fn name(&self) -> &'static str {
            "down"
        }
        fn is_indexed(&self) -> bool {
            true
        }
        async fn put_metadata(&self, _record: &ImageRecord) -> Result<()> {
            self.fail()
        }
        async fn get_metadata(&self, _id: &str) -> Result<ImageRecord> {
            self.fail()
        }
        async fn attach_derived(&self, _id: &str, _a: &[DerivedArtifact]) -> Result<()> {
            self.fail()
        }
        async fn delete_metadata(&self, _id: &str) -> Result<bool> {
            self.fail()
        }
        async fn list_ids_by_tags(&self, _r: &[String], _e: &[String]) -> Result<Vec<String>> {
            self.fail()
        }
        async fn list_all_ids(&self) -> Result<Vec<String>> {
            self.fail()
        }
        async fn all_unique_tags(&self) -> Result<Vec<String>> {
            self.fail()
        }
        async fn expired_ids(&self, _now: DateTime<Utc>) -> Result<Vec<String>> {
            self.fail()
        }
    }

    /// Reachable index that refuses every write and holds no records
    struct RejectingIndex;

    #[async_trait]
    impl MetadataStore for RejectingIndex {
        fn name(&self) -> &'static str {
            "rejecting"
        }
        fn is_indexed(&self) -> bool {
            true
        }
        async fn put_metadata(&self, _record: &ImageRecord) -> Result<()> {
            Err(ImageError::Internal("OOM command not allowed".to_string()))
        }
        async fn get_metadata(&self, id: &str) -> Result<ImageRecord> {
            Err(ImageError::NotFound(format!("image {id}")))
        }
        async fn attach_derived(&self, id: &str, _a: &[DerivedArtifact]) -> Result<()> {
            Err(ImageError::NotFound(format!("image {id}")))
        }
        async fn delete_metadata(&self, _id: &str) -> Result<bool> {
            Ok(false)
        }
        async fn list_ids_by_tags(&self, _r: &[String], _e: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn list_all_ids(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn all_unique_tags(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn expired_ids(&self, _now: DateTime<Utc>) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn record(id: &str, tag: &str) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            original_format: SourceFormat::Jpeg,
            orientation: Orientation::Landscape,
            width: 4,
            height: 3,
            tags: BTreeSet::from([tag.to_string()]),
            expiry_at: None,
            paths: BTreeMap::new(),
            sizes: BTreeMap::new(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
        }
    }

    async fn stores() -> (tempfile::TempDir, Arc<DownIndex>, IndexedMetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path(), std::time::Duration::from_secs(5))
            .await
            .unwrap();
        let scan: Arc<dyn MetadataStore> = Arc::new(ScanMetadataStore::new(Arc::new(blobs)));
        let index = Arc::new(DownIndex::default());
        let store = IndexedMetadataStore::new(Some(index.clone() as Arc<dyn MetadataStore>), scan);
        (dir, index, store)
    }

    #[tokio::test]
    async fn test_writes_survive_index_outage() {
        let (_dir, index, store) = stores().await;
        store.put_metadata(&record("a", "cat")).await.unwrap();
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);
        assert!(store.is_indexed());
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_scan() {
        let (_dir, _index, store) = stores().await;
        store.put_metadata(&record("a", "cat")).await.unwrap();
        store.put_metadata(&record("b", "dog")).await.unwrap();

        assert_eq!(store.get_metadata("a").await.unwrap().id, "a");
        assert_eq!(
            store
                .list_ids_by_tags(&["cat".to_string()], &[])
                .await
                .unwrap(),
            vec!["a".to_string()]
        );
        assert_eq!(
            store.all_unique_tags().await.unwrap(),
            vec!["cat".to_string(), "dog".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_surfaces_index_errors() {
        let (_dir, _index, store) = stores().await;
        store.put_metadata(&record("a", "cat")).await.unwrap();
        assert!(store.delete_metadata("a").await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_unindexed_record_still_expires() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path(), std::time::Duration::from_secs(5))
            .await
            .unwrap();
        let scan: Arc<dyn MetadataStore> = Arc::new(ScanMetadataStore::new(Arc::new(blobs)));
        let store = IndexedMetadataStore::new(Some(Arc::new(RejectingIndex) as Arc<dyn MetadataStore>), scan);

        let mut short = record("short", "cat");
        short.expiry_at = Some(short.created_at + chrono::Duration::minutes(1));
        store.put_metadata(&short).await.unwrap();
        store.put_metadata(&record("forever", "dog")).await.unwrap();

        let later = short.created_at + chrono::Duration::minutes(2);
        assert_eq!(store.expired_ids(later).await.unwrap(), vec!["short".to_string()]);
        assert!(store.expired_ids(short.created_at).await.unwrap().is_empty());

        assert_eq!(store.get_metadata("short").await.unwrap().id, "short");
        assert!(store.delete_metadata("short").await.unwrap());
        assert!(store.expired_ids(later).await.unwrap().is_empty());
    }
}
