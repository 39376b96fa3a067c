pub mod cache;
pub mod did;
pub mod resolver;

#[cfg(test)]
pub(crate) mod tests;

use crate::metrics;
use crate::types::{DidResolutionError, IdentityError};
use async_trait::async_trait;
use dashmap::DashSet;
use rsky_identity::types::DidDocument;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use cache::DidCache;
pub use resolver::DidResolver;

/// What the pipeline needs to know about an account to contact and trust its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub did: String,
    pub handle: Option<String>,
    /// did:key form
    pub signing_key: String,
    pub pds: String,
}

impl ResolvedIdentity {
    pub fn from_document(did: &str, doc: &DidDocument) -> Result<Self, IdentityError> {
        let signing_key = did::get_signing_key(doc).ok_or_else(|| {
            IdentityError::PoorlyFormattedDidDocument("missing #atproto signing key".into())
        })?;
        let pds = did::get_pds_endpoint(doc).ok_or_else(|| {
            IdentityError::PoorlyFormattedDidDocument("missing #atproto_pds service".into())
        })?;
        Ok(Self {
            did: did.to_owned(),
            handle: did::get_handle(doc),
            signing_key,
            pds,
        })
    }
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<ResolvedIdentity, DidResolutionError>;
}

/// Caching resolver. Fresh hits return immediately; stale hits return the
/// cached identity and refresh it in the background; misses and expired
/// entries resolve inline.
#[derive(Clone)]
pub struct IdResolver {
    did_resolver: DidResolver,
    cache: Arc<DidCache>,
    // dids with a background refresh running
    refreshing: Arc<DashSet<String>>,
}

impl IdResolver {
    pub fn new(
        plc_url: impl Into<String>,
        timeout: Duration,
        stale_ttl: Duration,
        max_ttl: Duration,
    ) -> Self {
        Self {
            did_resolver: DidResolver::new(plc_url, timeout),
            cache: Arc::new(DidCache::new(stale_ttl, max_ttl)),
            refreshing: Arc::new(DashSet::new()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &DidCache {
        &self.cache
    }

    /// Resolves without consulting the cache, then stores the result.
    pub async fn refresh(&self, did: &str) -> Result<ResolvedIdentity, DidResolutionError> {
        let method = did.split(':').nth(1).unwrap_or("unknown");
        metrics::IDENTITY_RESOLUTIONS_TOTAL
            .with_label_values(&[method])
            .inc();

        let result = match self.did_resolver.resolve_no_cache(did).await {
            Ok(Some(doc)) => ResolvedIdentity::from_document(did, &doc),
            Ok(None) => Err(IdentityError::DidNotFound),
            Err(e) => Err(e),
        };

        match result {
            Ok(identity) => {
                self.cache.cache_did(identity.clone());
                Ok(identity)
            }
            Err(e) => {
                metrics::IDENTITY_RESOLUTION_ERRORS_TOTAL.inc();
                if matches!(e, IdentityError::DidNotFound) {
                    self.cache.clear_entry(did);
                }
                Err(DidResolutionError::new(did, e))
            }
        }
    }

    /// At most one background refresh per DID; stale reads that arrive
    /// while one is running just serve the cached identity.
    fn spawn_refresh(&self, did: &str) {
        if !self.refreshing.insert(did.to_owned()) {
            return;
        }
        let this = self.clone();
        let did = did.to_owned();
        tokio::spawn(async move {
            if let Err(e) = this.refresh(&did).await {
                tracing::warn!("background did refresh failed: {e}");
            }
            this.refreshing.remove(&did);
        });
    }
}

#[async_trait]
impl IdentityResolver for IdResolver {
    async fn resolve(&self, did: &str) -> Result<ResolvedIdentity, DidResolutionError> {
        if let Some(hit) = self.cache.check_cache(did) {
            metrics::IDENTITY_CACHE_HITS_TOTAL.inc();
            if hit.stale {
                metrics::IDENTITY_CACHE_STALE_TOTAL.inc();
                self.spawn_refresh(did);
            }
            return Ok(hit.identity);
        }

        metrics::IDENTITY_CACHE_MISSES_TOTAL.inc();
        self.refresh(did).await
    }
}
