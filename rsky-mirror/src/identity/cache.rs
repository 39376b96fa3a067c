use crate::identity::ResolvedIdentity;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheVal {
    identity: ResolvedIdentity,
    updated_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CacheResult {
    pub identity: ResolvedIdentity,
    pub stale: bool,
}

/// In-memory identity cache with two horizons: entries older than
/// `stale_ttl` are still served but flagged, entries older than `max_ttl`
/// are evicted on lookup.
#[derive(Debug)]
pub struct DidCache {
    stale_ttl: Duration,
    max_ttl: Duration,
    cache: DashMap<String, CacheVal>,
}

impl DidCache {
    #[must_use]
    pub fn new(stale_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            stale_ttl,
            max_ttl: max_ttl.max(stale_ttl),
            cache: DashMap::new(),
        }
    }

    pub fn cache_did(&self, identity: ResolvedIdentity) {
        self.cache.insert(
            identity.did.clone(),
            CacheVal {
                identity,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn check_cache(&self, did: &str) -> Option<CacheResult> {
        let age = {
            let val = self.cache.get(did)?;
            val.updated_at.elapsed()
        };
        if age > self.max_ttl {
            self.cache.remove(did);
            return None;
        }
        let val = self.cache.get(did)?;
        Some(CacheResult {
            identity: val.identity.clone(),
            stale: age > self.stale_ttl,
        })
    }

    pub fn clear_entry(&self, did: &str) {
        self.cache.remove(did);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
