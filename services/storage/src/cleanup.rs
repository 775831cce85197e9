use crate::clock::Clock;
use crate::error::{ImageError, Result};
use crate::metadata::MetadataStore;
use crate::purge::Purger;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Expired records whose blobs and metadata were removed
    pub expired_removed: usize,
    /// Candidates not expired on inspection or already removed elsewhere
    pub skipped: usize,
    /// Records that failed or timed out; retried next sweep
    pub errors: usize,
}

/// Removes images whose expiry has passed
pub struct ExpiryCleaner {
    metadata: Arc<dyn MetadataStore>,
    purger: Arc<Purger>,
    clock: Arc<dyn Clock>,
    record_timeout: Duration,
    sweep_lock: tokio::sync::Mutex<()>,
}

impl ExpiryCleaner {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        purger: Arc<Purger>,
        clock: Arc<dyn Clock>,
        record_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            purger,
            clock,
            record_timeout,
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Sweep once. Waits for a sweep already in progress instead of overlapping it.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let _guard = self.sweep_lock.lock().await;
        let start = Instant::now();
        let now = self.clock.now();

        let candidates = self.metadata.expired_ids(now).await?;
        let mut report = CleanupReport::default();

        for id in candidates {
            match tokio::time::timeout(self.record_timeout, self.remove_if_expired(&id)).await {
                Ok(Ok(true)) => report.expired_removed += 1,
                Ok(Ok(false)) => report.skipped += 1,
                Ok(Err(e)) => {
                    warn!(id = %id, error = %e, "Failed to remove expired image");
                    report.errors += 1;
                }
                Err(_) => {
                    warn!(id = %id, timeout_secs = self.record_timeout.as_secs(), "Expired image removal timed out");
                    report.errors += 1;
                }
            }
        }

        metrics::counter!("imgpool.cleanup.expired").increment(report.expired_removed as u64);
        metrics::counter!("imgpool.cleanup.errors").increment(report.errors as u64);
        metrics::histogram!("imgpool.cleanup.sweep_seconds").record(start.elapsed().as_secs_f64());

        info!(
            expired_removed = report.expired_removed,
            skipped = report.skipped,
            errors = report.errors,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Expiry sweep finished"
        );
        Ok(report)
    }

    /// Re-check the record before purging; a concurrent delete may have won
    async fn remove_if_expired(&self, id: &str) -> Result<bool> {
        let record = match self.metadata.get_metadata(id).await {
            Ok(record) => record,
            Err(ImageError::NotFound(_)) => {
                debug!(id = %id, "Expired image already removed");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if !record.is_expired(self.clock.now()) {
            return Ok(false);
        }

        self.purger.purge(id).await?;
        Ok(true)
    }

    /// Run sweeps every `interval` until `token` is cancelled.
    /// The first sweep happens one interval after start.
    pub fn spawn(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            info!(interval_secs = interval.as_secs(), "Expiry cleaner started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "Expiry sweep failed");
                        }
                    }
                }
            }

            info!("Expiry cleaner stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobEntry, BlobStore, LocalBlobStore, StorageError};
    use crate::cache::ListingCache;
    use crate::clock::ManualClock;
    use crate::layout::original_key;
    use crate::metadata::ScanMetadataStore;
    use crate::model::{ImageRecord, Orientation, Rendition, SourceFormat};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<ManualClock>,
        cleaner: Arc<ExpiryCleaner>,
    }

    /// Deletes fail for keys mentioning "broken" and never finish for "stuck"
    struct FlakyDeletes {
        inner: LocalBlobStore,
    }

    #[async_trait]
    impl BlobStore for FlakyDeletes {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn put(&self, key: &str, data: Bytes) -> std::result::Result<(), StorageError> {
            self.inner.put(key, data).await
        }
        async fn get(&self, key: &str) -> std::result::Result<Bytes, StorageError> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> std::result::Result<bool, StorageError> {
            if key.contains("broken") {
                return Err(StorageError::Unavailable("disk offline".to_string()));
            }
            if key.contains("stuck") {
                std::future::pending::<()>().await;
            }
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> std::result::Result<Vec<BlobEntry>, StorageError> {
            self.inner.list(prefix).await
        }
        async fn exists(&self, key: &str) -> std::result::Result<bool, StorageError> {
            self.inner.exists(key).await
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(false, Duration::from_secs(5)).await
    }

    async fn fixture_with(flaky: bool, record_timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalBlobStore::new(dir.path(), Duration::from_secs(5)).await.unwrap();
        let blobs: Arc<dyn BlobStore> = if flaky {
            Arc::new(FlakyDeletes { inner: local })
        } else {
            Arc::new(local)
        };
        let metadata: Arc<dyn MetadataStore> = Arc::new(ScanMetadataStore::new(blobs.clone()));
        let purger = Arc::new(Purger::new(
            blobs.clone(),
            metadata.clone(),
            Arc::new(ListingCache::new(8)),
        ));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
        ));
        let cleaner = Arc::new(ExpiryCleaner::new(
            metadata.clone(),
            purger,
            clock.clone(),
            record_timeout,
        ));
        Fixture {
            _dir: dir,
            blobs,
            metadata,
            clock,
            cleaner,
        }
    }

    async fn store(fx: &Fixture, id: &str, expiry_minutes: Option<i64>) {
        let now = fx.clock.now();
        let key = original_key(id, SourceFormat::Png, Orientation::Landscape);
        fx.blobs.put(&key, Bytes::from_static(b"png")).await.unwrap();

        let mut record = ImageRecord {
            id: id.to_string(),
            original_format: SourceFormat::Png,
            orientation: Orientation::Landscape,
            width: 2,
            height: 1,
            tags: Default::default(),
            expiry_at: expiry_minutes.map(|m| now + chrono::Duration::minutes(m)),
            paths: BTreeMap::new(),
            sizes: BTreeMap::new(),
            created_at: now,
        };
        record.attach(Rendition::Original, key, 3);
        fx.metadata.put_metadata(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let fx = fixture().await;
        store(&fx, "short", Some(1)).await;
        store(&fx, "long", Some(60)).await;
        store(&fx, "forever", None).await;

        let report = fx.cleaner.run_once().await.unwrap();
        assert_eq!(report, CleanupReport::default());

        fx.clock.advance(chrono::Duration::minutes(2));
        let report = fx.cleaner.run_once().await.unwrap();
        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.errors, 0);

        assert!(fx.metadata.get_metadata("short").await.unwrap_err().is_not_found());
        assert!(!fx
            .blobs
            .exists("original/landscape/short.png")
            .await
            .unwrap());
        assert!(fx.metadata.get_metadata("long").await.is_ok());
        assert!(fx.metadata.get_metadata("forever").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_do_not_double_count() {
        let fx = fixture().await;
        store(&fx, "a", Some(1)).await;
        store(&fx, "b", Some(1)).await;
        fx.clock.advance(chrono::Duration::minutes(5));

        let (first, second) = tokio::join!(fx.cleaner.run_once(), fx.cleaner.run_once());
        let total = first.unwrap().expired_removed + second.unwrap().expired_removed;
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_spawned_cleaner_stops_on_cancel() {
        let fx = fixture().await;
        let token = CancellationToken::new();
        let handle = fx
            .cleaner
            .clone()
            .spawn(Duration::from_millis(10), token.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failing_records_do_not_abort_sweep() {
        let fx = fixture_with(true, Duration::from_millis(100)).await;
        for id in ["a", "broken", "stuck", "b"] {
            store(&fx, id, Some(1)).await;
        }
        fx.clock.advance(chrono::Duration::minutes(2));

        let report = tokio::time::timeout(Duration::from_secs(5), fx.cleaner.run_once())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            report,
            CleanupReport {
                expired_removed: 2,
                skipped: 0,
                errors: 2,
            }
        );

        assert!(fx.metadata.get_metadata("a").await.unwrap_err().is_not_found());
        assert!(fx.metadata.get_metadata("b").await.unwrap_err().is_not_found());
        // Failed records stay for the next sweep
        assert!(fx.metadata.get_metadata("broken").await.is_ok());
        assert!(fx.metadata.get_metadata("stuck").await.is_ok());
    }
}
