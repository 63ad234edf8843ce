//! # Deduplicating caches
//!
//! Every scheduled call may carry a [`CacheKey`]. Calls with a key go through the [`TtlCache`] of
//! the call class the key belongs to, see [`CacheName`]:
//!
//! - A fresh completed value is returned right away, the call never enters the queue.
//! - If a call for the same key is already queued or running, the caller joins its
//!   [`TaskFuture`](crate::TaskFuture) and receives the very same settlement.
//! - Otherwise the call registers itself as the pending execution for its key.
//!
//! When the execution settles, its registration is replaced by the value on success. Failures are
//! never cached: the registration is removed, so the next caller triggers a fresh execution.
//!
//! ### Expiry and eviction
//!
//! Each cache has its own TTL and capacity, configured through
//! [`CacheConfigs`](crate::config::CacheConfigs). Values older than the TTL are treated as absent and
//! dropped when they are accessed. When a new key is inserted into a full cache, the oldest
//! completed value is evicted. Pending registrations are neither expired nor evicted.
//!
//! ### Metrics
//!
//! Each of those is tagged with the `cache` name:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by a fresh completed value.
//! - `caches.evicted`: Values evicted because the cache was full.

mod cache_key;
mod config;
mod ttl;


pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use config::CacheName;
pub use ttl::{Entry, Lookup, TtlCache};

use crate::config::CacheConfigs;

/// One [`TtlCache`] per [`CacheName`].
#[derive(Debug)]
pub struct Caches<T> {
    categories: TtlCache<T>,
    catalog: TtlCache<T>,
    listings: TtlCache<T>,
    content: TtlCache<T>,
}

impl<T: Clone> Caches<T> {
    pub fn from_config(config: &CacheConfigs) -> Self {
        let cache = |name| TtlCache::new(name, config.get(name));
        Self {
            categories: cache(CacheName::Categories),
            catalog: cache(CacheName::Catalog),
            listings: cache(CacheName::Listings),
            content: cache(CacheName::Content),
        }
    }

    pub fn get(&self, name: CacheName) -> &TtlCache<T> {
        match name {
            CacheName::Categories => &self.categories,
            CacheName::Catalog => &self.catalog,
            CacheName::Listings => &self.listings,
            CacheName::Content => &self.content,
        }
    }

    /// The cache responsible for `key`.
    pub fn for_key(&self, key: &CacheKey) -> &TtlCache<T> {
        self.get(key.cache_name())
    }

    pub fn clear(&self) {
        for name in CacheName::ALL {
            self.get(name).clear();
        }
    }
}
