use crate::blob_store::BlobStore;
use crate::clock::Clock;
use crate::error::{ImageError, Result};
use crate::layout::{id_from_key, original_prefix};
use crate::metadata::MetadataStore;
use crate::model::{normalize_filter, ImageRecord, Orientation, Rendition, SourceFormat};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Selection responses differ on every request and must not be cached
pub const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

const LOAD_CONCURRENCY: usize = 16;

/// Coarse client class supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    Mobile,
    #[default]
    Desktop,
}

impl DeviceClass {
    pub fn preferred_orientation(self) -> Orientation {
        match self {
            Self::Mobile => Orientation::Portrait,
            Self::Desktop => Orientation::Landscape,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatPreference {
    #[default]
    BestAvailable,
    Webp,
    Avif,
    Original,
}

impl FormatPreference {
    /// Map client capability flags to a preference
    pub fn negotiate(accepts_avif: bool, accepts_webp: bool) -> Self {
        match (accepts_avif, accepts_webp) {
            (true, true) => Self::BestAvailable,
            (true, false) => Self::Avif,
            (false, true) => Self::Webp,
            (false, false) => Self::Original,
        }
    }

    /// Renditions to try in order, always ending with the original
    pub fn order(self, source: SourceFormat) -> &'static [Rendition] {
        if source.prefers_original() && matches!(self, Self::BestAvailable | Self::Original) {
            return &[Rendition::Original];
        }
        match self {
            Self::BestAvailable => &[Rendition::Avif, Rendition::Webp, Rendition::Original],
            Self::Webp => &[Rendition::Webp, Rendition::Original],
            Self::Avif => &[Rendition::Avif, Rendition::Original],
            Self::Original => &[Rendition::Original],
        }
    }
}

/// Criteria for one random pick
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    /// Falls back to the device's preferred orientation
    pub orientation: Option<Orientation>,
    pub required_tags: Vec<String>,
    pub excluded_tags: Vec<String>,
    pub preference: FormatPreference,
    pub device: DeviceClass,
}

impl SelectionRequest {
    pub fn builder() -> SelectionRequestBuilder {
        SelectionRequestBuilder::default()
    }

    pub fn effective_orientation(&self) -> Orientation {
        self.orientation
            .unwrap_or_else(|| self.device.preferred_orientation())
    }
}

/// Builder for [`SelectionRequest`]
#[derive(Debug, Default)]
pub struct SelectionRequestBuilder {
    request: SelectionRequest,
}

impl SelectionRequestBuilder {
    pub fn orientation(mut self, orientation: Orientation) -> Self {
        self.request.orientation = Some(orientation);
        self
    }

    pub fn require_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.required_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.excluded_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn preference(mut self, preference: FormatPreference) -> Self {
        self.request.preference = preference;
        self
    }

    pub fn device(mut self, device: DeviceClass) -> Self {
        self.request.device = device;
        self
    }

    pub fn build(self) -> SelectionRequest {
        self.request
    }
}

/// A resolved random image
#[derive(Debug, Clone)]
pub struct SelectedImage {
    pub id: String,
    pub rendition: Rendition,
    pub key: String,
    pub data: Bytes,
    pub content_type: &'static str,
    pub cache_control: &'static str,
}

/// Picks a uniformly random image matching orientation and tag filters
pub struct RandomSelector {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl RandomSelector {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blobs,
            metadata,
            clock,
        }
    }

    #[instrument(skip(self, request), fields(orientation = %request.effective_orientation()))]
    pub async fn select(&self, request: &SelectionRequest) -> Result<SelectedImage> {
        let orientation = request.effective_orientation();
        let required = normalize_filter(&request.required_tags);
        let excluded = normalize_filter(&request.excluded_tags);
        let now = self.clock.now();

        let mut candidates = self
            .candidates(orientation, &required, &excluded, now)
            .await?;
        debug!(candidates = candidates.len(), "Built candidate set");

        // Draw without replacement until a live record turns up
        while !candidates.is_empty() {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            let id = candidates.swap_remove(index);

            let record = match self.metadata.get_metadata(&id).await {
                Ok(record) => record,
                Err(ImageError::NotFound(_)) => {
                    trace!(id = %id, "Candidate has no metadata");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if record.is_expired(now) || record.orientation != orientation {
                continue;
            }

            match self.resolve(&record, request.preference).await {
                // Blobs gone while metadata survived, e.g. a partially failed delete
                Err(ImageError::NotFound(reason)) => {
                    debug!(id = %id, reason = %reason, "Candidate has no servable blob");
                }
                result => return result,
            }
        }

        Err(ImageError::NotFound(
            "no images match the requested filters".to_string(),
        ))
    }

    async fn candidates(
        &self,
        orientation: Orientation,
        required: &[String],
        excluded: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let filtered = !required.is_empty() || !excluded.is_empty();

        if filtered && self.metadata.is_indexed() {
            let ids = self.metadata.list_ids_by_tags(required, excluded).await?;
            return self
                .load_matching(ids, |r| {
                    r.orientation == orientation
                        && !r.original_format.is_animated()
                        && !r.is_expired(now)
                })
                .await;
        }

        let ids: Vec<String> = self
            .blobs
            .list(&original_prefix(orientation))
            .await?
            .iter()
            .filter_map(|entry| id_from_key(&entry.key).map(String::from))
            .collect();

        if !filtered {
            return Ok(ids);
        }

        self.load_matching(ids, |r| {
            r.matches_tags(required, excluded) && !r.is_expired(now)
        })
        .await
    }

    /// Load each record and keep the ids passing `keep`. Missing records are dropped.
    async fn load_matching<F>(&self, ids: Vec<String>, keep: F) -> Result<Vec<String>>
    where
        F: Fn(&ImageRecord) -> bool,
    {
        let metadata = &self.metadata;
        let loaded: Vec<Result<Option<ImageRecord>>> = stream::iter(ids)
            .map(|id| async move {
                match metadata.get_metadata(&id).await {
                    Ok(record) => Ok(Some(record)),
                    Err(ImageError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(LOAD_CONCURRENCY)
            .collect()
            .await;

        let mut kept = Vec::new();
        for item in loaded {
            if let Some(record) = item? {
                if keep(&record) {
                    kept.push(record.id);
                }
            }
        }
        Ok(kept)
    }

    /// Serve the first rendition in preference order whose blob exists
    async fn resolve(
        &self,
        record: &ImageRecord,
        preference: FormatPreference,
    ) -> Result<SelectedImage> {
        for &rendition in preference.order(record.original_format) {
            let Some(key) = record.path(rendition) else {
                continue;
            };

            match self.blobs.get(key).await {
                Ok(data) => {
                    let content_type = match rendition {
                        Rendition::Original => record.original_format.content_type(),
                        _ => crate::layout::content_type_for(key),
                    };
                    metrics::counter!("imgpool.selection.served").increment(1);
                    return Ok(SelectedImage {
                        id: record.id.clone(),
                        rendition,
                        key: key.to_string(),
                        data,
                        content_type,
                        cache_control: NO_CACHE,
                    });
                }
                Err(e) if e.is_not_found() => {
                    debug!(id = %record.id, format = %rendition, "Blob missing, trying next format");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ImageError::NotFound(format!(
            "original blob for image {}",
            record.id
        )))
    }
}
