use crate::blob_store::{BlobStore, LocalBlobStore, S3BlobStore};
use crate::cache::ListingCache;
use crate::cleanup::{CleanupReport, ExpiryCleaner};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, Config};
use crate::conversion::{
    CommandEncoder, ConversionError, ConversionJob, ConversionPipeline, ConversionStats, Encoder,
};
use crate::error::{ImageError, Result};
use crate::layout::original_key;
use crate::listing::{Lister, ListingPage, ListingQuery};
use crate::metadata::{IndexedMetadataStore, MetadataStore, RedisMetadataStore, ScanMetadataStore};
use crate::model::{generate_id, normalize_tags, ImageRecord, Orientation, Rendition, SourceFormat};
use crate::purge::Purger;
use crate::selector::{RandomSelector, SelectedImage, SelectionRequest};
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Returned by a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub id: String,
    pub format: SourceFormat,
    pub orientation: Orientation,
    pub original_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteReceipt {
    pub deleted_blobs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether queued conversions finished within the grace period
    pub conversion_drained: bool,
}

/// Entry point for uploads, deletes, selection, listing and cleanup
pub struct ImageService {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    cache: Arc<ListingCache>,
    lister: Lister,
    selector: RandomSelector,
    purger: Arc<Purger>,
    conversion: Option<ConversionPipeline>,
    cleaner: Arc<ExpiryCleaner>,
    cleaner_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    accepting: AtomicBool,
}

impl ImageService {
    /// Wire the core around already constructed backends.
    /// Must be called inside a Tokio runtime when conversion is enabled.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        encoder: Arc<dyn Encoder>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let cache = Arc::new(ListingCache::new(config.listing.cache_max_entries));
        let purger = Arc::new(Purger::new(blobs.clone(), metadata.clone(), cache.clone()));

        let conversion = config.conversion.enabled.then(|| {
            ConversionPipeline::start(
                config.conversion.workers,
                config.conversion.queue_capacity,
                encoder,
                blobs.clone(),
                metadata.clone(),
            )
        });

        let cleaner = Arc::new(ExpiryCleaner::new(
            metadata.clone(),
            purger.clone(),
            clock.clone(),
            config.cleanup_record_timeout(),
        ));

        Self {
            lister: Lister::new(
                metadata.clone(),
                cache.clone(),
                config.listing.default_page_size,
                config.listing.max_page_size,
            ),
            selector: RandomSelector::new(blobs.clone(), metadata.clone(), clock.clone()),
            blobs,
            metadata,
            clock,
            cache,
            purger,
            conversion,
            cleaner,
            cleaner_task: Mutex::new(None),
            accepting: AtomicBool::new(true),
        }
    }

    /// Build backends from configuration: the blob store, the scan metadata
    /// store on top of it, and the Redis index when a URL is configured.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let blobs: Arc<dyn BlobStore> = match config.storage.backend {
            BackendKind::Local => Arc::new(
                LocalBlobStore::new(config.storage.local_root.clone(), config.request_timeout())
                    .await
                    .context("Failed to initialize local blob store")?,
            ),
            BackendKind::S3 => Arc::new(
                S3BlobStore::new(&config.s3, config.request_timeout())
                    .await
                    .context("Failed to initialize S3 blob store")?,
            ),
        };

        let scan: Arc<dyn MetadataStore> = Arc::new(ScanMetadataStore::new(blobs.clone()));
        let index: Option<Arc<dyn MetadataStore>> = match config.redis.url {
            Some(_) => {
                let store = RedisMetadataStore::connect(&config.redis)
                    .await
                    .context("Failed to connect to Redis metadata index")?;
                store.ping().await.context("Redis metadata index did not answer PING")?;
                Some(Arc::new(store) as Arc<dyn MetadataStore>)
            }
            None => {
                info!("No Redis URL configured, running in scan-only metadata mode");
                None
            }
        };
        let metadata: Arc<dyn MetadataStore> = Arc::new(IndexedMetadataStore::new(index, scan));

        info!(
            blob_backend = blobs.name(),
            metadata_backend = metadata.name(),
            "Image service backends ready"
        );

        Ok(Self::new(
            blobs,
            metadata,
            Arc::new(CommandEncoder::new(&config.conversion)),
            Arc::new(SystemClock),
            config,
        ))
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn conversion_stats(&self) -> Option<ConversionStats> {
        self.conversion.as_ref().map(ConversionPipeline::stats)
    }

    /// Store an original and its metadata, then queue derived formats.
    ///
    /// `expiry_minutes = 0` means the image never expires.
    #[instrument(skip(self, data, tags), fields(size_bytes = data.len(), extension = %declared_extension))]
    pub async fn upload(
        &self,
        data: Bytes,
        declared_extension: &str,
        tags: &[String],
        expiry_minutes: u64,
    ) -> Result<UploadReceipt> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ImageError::BackendUnavailable(
                "service is shutting down".to_string(),
            ));
        }

        let (format, width, height) = inspect(&data, declared_extension)?;
        let orientation = Orientation::from_dimensions(width, height);
        let now = self.clock.now();
        let id = generate_id(now);
        let key = original_key(&id, format, orientation);
        let size = data.len() as u64;
        let expiry_at = expiry_deadline(now, expiry_minutes)?;

        self.blobs.put(&key, data.clone()).await?;

        let mut record = ImageRecord {
            id: id.clone(),
            original_format: format,
            orientation,
            width,
            height,
            tags: normalize_tags(tags),
            expiry_at,
            paths: BTreeMap::new(),
            sizes: BTreeMap::new(),
            created_at: now,
        };
        record.attach(Rendition::Original, key.clone(), size);

        if let Err(e) = self.metadata.put_metadata(&record).await {
            warn!(id = %id, error = %e, "Metadata write failed, removing original");
            if let Err(cleanup) = self.blobs.delete(&key).await {
                warn!(key = %key, error = %cleanup, "Failed to remove original after metadata failure");
            }
            return Err(e);
        }

        self.cache.invalidate_all();
        metrics::counter!("imgpool.uploads.stored").increment(1);
        info!(
            id = %id,
            format = %format,
            orientation = %orientation,
            width = width,
            height = height,
            "Image stored"
        );

        if let Some(pipeline) = &self.conversion {
            if !format.is_animated() {
                let job = ConversionJob {
                    id: id.clone(),
                    orientation,
                    source_format: format,
                    data,
                };
                match pipeline.submit(job) {
                    Ok(()) | Err(ConversionError::QueueFull) => {}
                    Err(e) => debug!(id = %id, error = %e, "Conversion not queued"),
                }
            }
        }

        Ok(UploadReceipt {
            id,
            format,
            orientation,
            original_path: key,
        })
    }

    /// Remove an image. Deleting an unknown id reports zero blobs.
    pub async fn delete(&self, id: &str) -> Result<DeleteReceipt> {
        let outcome = self.purger.purge(id).await?;
        Ok(DeleteReceipt {
            deleted_blobs: outcome.deleted_blobs,
        })
    }

    /// Pick a random image. Backend failures surface as `NotFound`.
    pub async fn select_random(&self, request: &SelectionRequest) -> Result<SelectedImage> {
        match self.selector.select(request).await {
            Ok(image) => Ok(image),
            Err(e @ ImageError::NotFound(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Random selection failed");
                Err(ImageError::NotFound("no images found".to_string()))
            }
        }
    }

    pub async fn list_page(&self, query: &ListingQuery) -> Arc<ListingPage> {
        self.lister.list_page(query, self.clock.now()).await
    }

    pub async fn list_unique_tags(&self) -> Result<Vec<String>> {
        self.metadata.all_unique_tags().await
    }

    pub async fn trigger_cleanup_now(&self) -> Result<CleanupReport> {
        self.cleaner.run_once().await
    }

    /// Start periodic expiry sweeps. A second call is a no-op.
    pub fn start_cleaner(&self, interval: Duration) {
        let mut task = self.cleaner_task.lock();
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handle = self.cleaner.clone().spawn(interval, token.clone());
        *task = Some((token, handle));
    }

    /// Stop intake, drain conversions within `grace`, then stop the cleaner
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.accepting.store(false, Ordering::SeqCst);
        info!("Image service no longer accepting uploads");

        let conversion_drained = match &self.conversion {
            Some(pipeline) => pipeline.shutdown(grace).await,
            None => true,
        };

        let task = self.cleaner_task.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Expiry cleaner task ended abnormally");
            }
        }

        info!(conversion_drained = conversion_drained, "Image service stopped");
        ShutdownReport { conversion_drained }
    }
}

fn expiry_deadline(now: DateTime<Utc>, minutes: u64) -> Result<Option<DateTime<Utc>>> {
    if minutes == 0 {
        return Ok(None);
    }
    i64::try_from(minutes)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .and_then(|d| now.checked_add_signed(d))
        .map(Some)
        .ok_or_else(|| ImageError::InvalidInput(format!("expiry of {minutes} minutes is out of range")))
}

/// Validate an upload: the declared extension and sniffed content must agree.
/// Returns the format and pixel dimensions without decoding the image.
fn inspect(data: &[u8], declared_extension: &str) -> Result<(SourceFormat, u32, u32)> {
    if data.is_empty() {
        return Err(ImageError::InvalidInput("empty upload".to_string()));
    }

    let declared = SourceFormat::from_extension(declared_extension).ok_or_else(|| {
        ImageError::InvalidInput(format!("unsupported extension {declared_extension:?}"))
    })?;

    let sniffed = image::guess_format(data)
        .map_err(|_| ImageError::InvalidInput("unrecognized image content".to_string()))?;
    let (detected, image_format) = match sniffed {
        ImageFormat::Jpeg => (SourceFormat::Jpeg, ImageFormat::Jpeg),
        ImageFormat::Png => (SourceFormat::Png, ImageFormat::Png),
        ImageFormat::Gif => (SourceFormat::Gif, ImageFormat::Gif),
        other => {
            return Err(ImageError::InvalidInput(format!(
                "unsupported image content {other:?}"
            )))
        }
    };

    if detected != declared {
        return Err(ImageError::InvalidInput(format!(
            "declared {declared} but content is {detected}"
        )));
    }

    let (width, height) = image::ImageReader::with_format(Cursor::new(data), image_format)
        .into_dimensions()
        .map_err(|e| ImageError::InvalidInput(format!("unreadable image: {e}")))?;

    if width == 0 || height == 0 {
        return Err(ImageError::InvalidInput("image has no pixels".to_string()));
    }

    Ok((declared, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(width, height);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_inspect_reads_dimensions() {
        let png = encode(30, 40, ImageFormat::Png);
        assert_eq!(inspect(&png, "PNG").unwrap(), (SourceFormat::Png, 30, 40));

        let jpeg = encode(64, 32, ImageFormat::Jpeg);
        assert_eq!(inspect(&jpeg, "jpeg").unwrap(), (SourceFormat::Jpeg, 64, 32));
    }

    #[test]
    fn test_expiry_deadline() {
        let now = Utc::now();
        assert_eq!(expiry_deadline(now, 0).unwrap(), None);
        assert_eq!(
            expiry_deadline(now, 1).unwrap(),
            Some(now + chrono::Duration::minutes(1))
        );
        assert!(expiry_deadline(now, u64::MAX).is_err());
    }

    #[test]
    fn test_inspect_rejects_mismatch_and_garbage() {
        let png = encode(4, 4, ImageFormat::Png);
        assert!(matches!(inspect(&png, "jpg"), Err(ImageError::InvalidInput(_))));
        assert!(matches!(inspect(&png, "bmp"), Err(ImageError::InvalidInput(_))));
        assert!(matches!(inspect(b"not an image", "png"), Err(ImageError::InvalidInput(_))));
        assert!(matches!(inspect(&[], "png"), Err(ImageError::InvalidInput(_))));
    }
}
