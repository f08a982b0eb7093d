// Process-wide TTL cache of page indices so that serve paths don't hit
// object storage on every request. The cache bounds freshness only; storage
// stays the source of truth.
use crate::domain::DomainScope;
use crate::index::PageIndex;
use crate::metrics_defs::{INDEX_CACHE_HIT, INDEX_CACHE_MISS};
use moka::notification::RemovalCause;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

const CAPACITY: u64 = 10_000;
const TTL: Duration = Duration::from_secs(60);

pub struct IndexCache {
    cache: Cache<DomainScope, Arc<PageIndex>>,
}

impl IndexCache {
    pub fn new() -> Self {
        let cache = Cache::builder()
            .max_capacity(CAPACITY)
            .time_to_live(TTL)
            .eviction_listener(|key: Arc<DomainScope>, _value, cause| match cause {
                RemovalCause::Expired => {
                    tracing::debug!(domain = %key, "page index expired");
                }
                RemovalCause::Explicit => {
                    tracing::debug!(domain = %key, "page index invalidated");
                }
                RemovalCause::Size => {
                    tracing::warn!(domain = %key, "page index cache capacity reached");
                }
                RemovalCause::Replaced => {}
            })
            .build();

        IndexCache { cache }
    }

    pub fn get(&self, scope: &DomainScope) -> Option<Arc<PageIndex>> {
        let hit = self.cache.get(scope);
        let metric = if hit.is_some() {
            INDEX_CACHE_HIT
        } else {
            INDEX_CACHE_MISS
        };
        metrics::counter!(metric.name).increment(1);
        hit
    }

    pub fn put(&self, scope: DomainScope, index: PageIndex) -> Arc<PageIndex> {
        let index = Arc::new(index);
        self.cache.insert(scope, index.clone());
        index
    }

    /// Drops the entry for `scope` so the next read goes to storage. Called
    /// by the ingest path after a successful index write.
    pub fn invalidate(&self, scope: &DomainScope) {
        self.cache.invalidate(scope);
    }
}

impl Default for IndexCache {
    fn default() -> Self {
        IndexCache::new()
    }
}
