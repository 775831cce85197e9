use crate::cache::{ListingCache, ListingKey};
use crate::error::{ImageError, Result};
use crate::metadata::MetadataStore;
use crate::model::{ImageRecord, Orientation, Rendition, SourceFormat};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Concurrent record loads while building a page
const LOAD_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatFilter {
    #[default]
    Any,
    Jpeg,
    Png,
    Gif,
    /// Has a WebP rendition
    Webp,
    /// Has an AVIF rendition
    Avif,
}

impl FormatFilter {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "any" | "all" => Some(Self::Any),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            _ => None,
        }
    }

    pub fn matches(self, record: &ImageRecord) -> bool {
        match self {
            Self::Any => true,
            Self::Jpeg => record.original_format == SourceFormat::Jpeg,
            Self::Png => record.original_format == SourceFormat::Png,
            Self::Gif => record.original_format == SourceFormat::Gif,
            Self::Webp => record.has(Rendition::Webp),
            Self::Avif => record.has(Rendition::Avif),
        }
    }
}

/// A listing request; pages are 1-based
#[derive(Debug, Clone, Default)]
pub struct ListingQuery {
    pub format: FormatFilter,
    pub orientation: Option<Orientation>,
    pub tag: Option<String>,
    pub page: usize,
    pub page_size: usize,
}

/// Listing view of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub original_format: SourceFormat,
    pub orientation: Orientation,
    pub tags: Vec<String>,
    pub paths: BTreeMap<Rendition, String>,
    pub sizes: BTreeMap<Rendition, u64>,
    pub expiry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ImageRecord> for ImageSummary {
    fn from(r: ImageRecord) -> Self {
        Self {
            id: r.id,
            original_format: r.original_format,
            orientation: r.orientation,
            tags: r.tags.into_iter().collect(),
            paths: r.paths,
            sizes: r.sizes,
            expiry_at: r.expiry_at,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingPage {
    pub items: Vec<ImageSummary>,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total: usize,
    /// Set when the page could not be computed
    pub error: Option<String>,
}

impl ListingPage {
    fn failed(page: usize, page_size: usize, err: &ImageError) -> Self {
        Self {
            items: Vec::new(),
            page,
            page_size,
            total_pages: 0,
            total: 0,
            error: Some(err.to_string()),
        }
    }
}

/// Answers paginated listing queries through the cache
pub struct Lister {
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<ListingCache>,
    default_page_size: usize,
    max_page_size: usize,
}

impl Lister {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<ListingCache>,
        default_page_size: usize,
        max_page_size: usize,
    ) -> Self {
        Self {
            metadata,
            cache,
            default_page_size: default_page_size.max(1),
            max_page_size: max_page_size.max(1),
        }
    }

    fn normalize(&self, query: &ListingQuery) -> ListingKey {
        let page_size = if query.page_size == 0 {
            self.default_page_size
        } else {
            query.page_size
        };
        ListingKey {
            format: query.format,
            orientation: query.orientation,
            tag: query
                .tag
                .as_deref()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
            page: query.page.max(1),
            page_size: page_size.clamp(1, self.max_page_size.max(self.default_page_size)),
        }
    }

    /// Never fails: backend errors produce an empty page with `error` set
    #[instrument(skip(self))]
    pub async fn list_page(&self, query: &ListingQuery, now: DateTime<Utc>) -> Arc<ListingPage> {
        let key = self.normalize(query);
        if let Some(page) = self.cache.get(&key) {
            return page;
        }

        let generation = self.cache.generation();
        match self.compute(&key, now).await {
            Ok(page) => {
                let page = Arc::new(page);
                self.cache.insert(key, page.clone(), generation);
                page
            }
            Err(e) => {
                metrics::counter!("imgpool.listing.errors").increment(1);
                warn!(error = %e, "Listing query failed");
                Arc::new(ListingPage::failed(key.page, key.page_size, &e))
            }
        }
    }

    async fn compute(&self, key: &ListingKey, now: DateTime<Utc>) -> Result<ListingPage> {
        let ids = match &key.tag {
            Some(tag) => {
                self.metadata
                    .list_ids_by_tags(std::slice::from_ref(tag), &[])
                    .await?
            }
            None => self.metadata.list_all_ids().await?,
        };

        let metadata = &self.metadata;
        let loaded: Vec<Result<Option<ImageRecord>>> = stream::iter(ids)
            .map(|id| async move {
                match metadata.get_metadata(&id).await {
                    Ok(record) => Ok(Some(record)),
                    Err(ImageError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .buffered(LOAD_CONCURRENCY)
            .collect()
            .await;

        let mut records = Vec::with_capacity(loaded.len());
        for item in loaded {
            if let Some(record) = item? {
                let visible = !record.is_expired(now)
                    && key.format.matches(&record)
                    && key.orientation.map_or(true, |o| record.orientation == o);
                if visible {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = records.len();
        let total_pages = total.div_ceil(key.page_size);
        let items = records
            .into_iter()
            .skip((key.page - 1) * key.page_size)
            .take(key.page_size)
            .map(ImageSummary::from)
            .collect();

        Ok(ListingPage {
            items,
            page: key.page,
            page_size: key.page_size,
            total_pages,
            total,
            error: None,
        })
    }
}
