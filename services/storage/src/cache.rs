use crate::listing::{FormatFilter, ListingPage};
use crate::model::Orientation;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Exact filter tuple and page parameters of a listing query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub format: FormatFilter,
    pub orientation: Option<Orientation>,
    pub tag: Option<String>,
    pub page: usize,
    pub page_size: usize,
}

/// Cache of computed listing pages.
///
/// Any create or delete clears the whole cache. Entries have no TTL.
pub struct ListingCache {
    entries: RwLock<HashMap<ListingKey, Arc<ListingPage>>>,
    max_entries: usize,
    /// Bumped on every invalidation so a page computed before a write is not stored after it
    generation: AtomicU64,
}

impl ListingCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            generation: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &ListingKey) -> Option<Arc<ListingPage>> {
        let hit = self.entries.read().get(key).cloned();
        let name = if hit.is_some() {
            "imgpool.listing.cache_hits"
        } else {
            "imgpool.listing.cache_misses"
        };
        metrics::counter!(name).increment(1);
        hit
    }

    /// Current generation, read before computing a page
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Store a page computed at `generation`; dropped if a write happened since
    pub fn insert(&self, key: ListingKey, page: Arc<ListingPage>, generation: u64) {
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            entries.clear();
        }
        entries.insert(key, page);
    }

    /// Drop every cached page
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = entries.len();
        entries.clear();
        if dropped > 0 {
            debug!(dropped = dropped, "Listing cache invalidated");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(page: usize) -> ListingKey {
        ListingKey {
            format: FormatFilter::Any,
            orientation: None,
            tag: None,
            page,
            page_size: 10,
        }
    }

    fn page(total: usize) -> Arc<ListingPage> {
        Arc::new(ListingPage {
            items: Vec::new(),
            page: 1,
            page_size: 10,
            total_pages: 0,
            total,
            error: None,
        })
    }

    #[test]
    fn test_hit_returns_stored_page() {
        let cache = ListingCache::new(8);
        let generation = cache.generation();
        cache.insert(key(1), page(3), generation);

        assert_eq!(cache.get(&key(1)).unwrap().total, 3);
        assert!(cache.get(&key(2)).is_none());
    }

    #[test]
    fn test_invalidate_all_clears() {
        let cache = ListingCache::new(8);
        cache.insert(key(1), page(1), cache.generation());
        cache.insert(key(2), page(2), cache.generation());

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_insert_is_discarded() {
        let cache = ListingCache::new(8);
        let before = cache.generation();
        cache.invalidate_all();
        cache.insert(key(1), page(1), before);
        assert!(cache.get(&key(1)).is_none());
    }

    #[test]
    fn test_capacity_resets_cache() {
        let cache = ListingCache::new(2);
        cache.insert(key(1), page(1), cache.generation());
        cache.insert(key(2), page(2), cache.generation());
        cache.insert(key(3), page(3), cache.generation());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(3)).is_some());
    }
}
