use crate::db::IndexReader;
use crate::types::MirrorError;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Positive-only cache over tracked-set membership.
///
/// A hit younger than `ttl` answers `true` without a query. Misses, expired
/// entries and every negative answer go to the index, so a stale cache can
/// delay admission but never deny it.
#[derive(Debug)]
pub struct TrackedCache {
    ttl: Duration,
    entries: DashMap<String, Instant>,
}

impl TrackedCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn hit(&self, did: &str) -> bool {
        let fresh = self.entries.get(did).map(|at| at.elapsed() < self.ttl);
        match fresh {
            Some(true) => true,
            Some(false) => {
                self.entries.remove(did);
                false
            }
            None => false,
        }
    }

    pub fn insert(&self, did: &str) {
        self.entries.insert(did.to_owned(), Instant::now());
    }

    pub fn invalidate(&self, did: &str) {
        self.entries.remove(did);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn is_tracked<R: IndexReader + ?Sized>(
        &self,
        reader: &R,
        did: &str,
    ) -> Result<bool, MirrorError> {
        if self.hit(did) {
            return Ok(true);
        }
        let tracked = reader.is_tracked(did).await?;
        if tracked {
            self.insert(did);
        }
        Ok(tracked)
    }

    /// Members of `dids` in the tracked set. Only cache misses are queried.
    pub async fn tracked_among<R: IndexReader + ?Sized>(
        &self,
        reader: &R,
        dids: &[String],
    ) -> Result<HashSet<String>, MirrorError> {
        let (mut tracked, misses): (HashSet<String>, Vec<String>) = {
            let mut hits = HashSet::new();
            let mut misses = Vec::new();
            for did in dids {
                if self.hit(did) {
                    hits.insert(did.clone());
                } else {
                    misses.push(did.clone());
                }
            }
            (hits, misses)
        };
        if misses.is_empty() {
            return Ok(tracked);
        }
        for did in reader.tracked_among(&misses).await? {
            self.insert(&did);
            tracked.insert(did);
        }
        Ok(tracked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;

    #[tokio::test]
    async fn test_negative_answers_are_not_cached() {
        let db = MemoryDatabase::new();
        let cache = TrackedCache::new(Duration::from_secs(60));
        assert!(!cache.is_tracked(&db, "did:plc:a").await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_positive_entry_serves_without_query() {
        let db = MemoryDatabase::new();
        let cache = TrackedCache::new(Duration::from_secs(60));
        cache.insert("did:plc:a");
        assert!(cache.is_tracked(&db, "did:plc:a").await.unwrap());

        let among = cache
            .tracked_among(&db, &["did:plc:a".to_owned(), "did:plc:b".to_owned()])
            .await
            .unwrap();
        assert_eq!(among, HashSet::from(["did:plc:a".to_owned()]));
    }

    #[tokio::test]
    async fn test_expired_entry_falls_back_to_index() {
        let db = MemoryDatabase::new();
        let cache = TrackedCache::new(Duration::ZERO);
        cache.insert("did:plc:a");
        assert!(!cache.is_tracked(&db, "did:plc:a").await.unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = TrackedCache::new(Duration::from_secs(60));
        cache.insert("did:plc:a");
        cache.insert("did:plc:b");
        cache.invalidate("did:plc:a");
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
