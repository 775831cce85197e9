use crate::blob_store::{BlobStore, StorageError};
use crate::cache::ListingCache;
use crate::error::{ImageError, Result};
use crate::layout::candidate_keys;
use crate::metadata::MetadataStore;
use crate::model::is_valid_id;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of removing one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Blobs that existed and were removed
    pub deleted_blobs: usize,
    /// Whether a metadata record was removed
    pub metadata_removed: bool,
}

/// Idempotent removal of an image's blobs and metadata.
///
/// Shared by explicit deletes and the expiry cleaner so whichever runs
/// second simply finds nothing left to remove.
pub struct Purger {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<ListingCache>,
}

impl Purger {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<ListingCache>,
    ) -> Self {
        Self {
            blobs,
            metadata,
            cache,
        }
    }

    /// Remove every blob of `id`, then its metadata.
    ///
    /// When a blob delete fails the metadata is kept so the call can be
    /// retried, and `ImageError::PartialFailure` is returned.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn purge(&self, id: &str) -> Result<PurgeOutcome> {
        if !is_valid_id(id) {
            return Err(ImageError::InvalidInput(format!("invalid image id: {id:?}")));
        }

        let recorded: BTreeSet<String> = match self.metadata.get_metadata(id).await {
            Ok(record) => record.paths.into_values().collect(),
            Err(ImageError::NotFound(_)) => BTreeSet::new(),
            Err(e) => return Err(e),
        };

        let mut deleted = 0;
        let mut failed = 0;

        let recorded: Vec<String> = recorded.into_iter().collect();
        for (key, result) in self.blobs.delete_many(&recorded).await {
            tally(&key, result, &mut deleted, &mut failed);
        }

        // Safety net for blobs whose recorded path drifted or was never written
        for key in candidate_keys(id) {
            if recorded.contains(&key) {
                continue;
            }
            let result = self.blobs.delete(&key).await;
            tally(&key, result, &mut deleted, &mut failed);
        }

        if failed > 0 {
            metrics::counter!("imgpool.deletes.partial").increment(1);
            warn!(deleted = deleted, failed = failed, "Blob deletes failed, metadata kept");
            if deleted > 0 {
                self.cache.invalidate_all();
            }
            return Err(ImageError::PartialFailure { deleted, failed });
        }

        let metadata_removed = self.metadata.delete_metadata(id).await?;
        if metadata_removed || deleted > 0 {
            self.cache.invalidate_all();
            info!(deleted_blobs = deleted, "Image removed");
        } else {
            debug!("Nothing left to remove");
        }

        Ok(PurgeOutcome {
            deleted_blobs: deleted,
            metadata_removed,
        })
    }
}

fn tally(key: &str, result: Result<bool, StorageError>, deleted: &mut usize, failed: &mut usize) {
    match result {
        Ok(true) => *deleted += 1,
        Ok(false) => {}
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to delete blob");
            *failed += 1;
        }
    }
}
