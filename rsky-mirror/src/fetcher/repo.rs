use crate::config::MAX_REPO_BYTES;
use crate::http;
use crate::identity::{IdentityResolver, ResolvedIdentity};
use crate::lexicon::Collection;
use crate::metrics;
use crate::record::Record;
use crate::repo;
use crate::types::MirrorError;
use crate::uri::AtUri;
use std::sync::Arc;
use std::time::Duration;

/// A verified repository snapshot, decoded into records of supported
/// collections.
#[derive(Debug)]
pub struct FetchedRepo {
    pub identity: ResolvedIdentity,
    pub rev: String,
    pub records: Vec<Record>,
}

/// Downloads whole repositories via `com.atproto.sync.getRepo` and verifies
/// them against the signing key in the author's DID document.
pub struct RepoFetcher {
    resolver: Arc<dyn IdentityResolver>,
    client: reqwest::Client,
    max_bytes: usize,
}

impl RepoFetcher {
    pub fn new(resolver: Arc<dyn IdentityResolver>, timeout: Duration) -> Result<Self, MirrorError> {
        Ok(Self {
            resolver,
            client: http::client(timeout)?,
            max_bytes: *MAX_REPO_BYTES,
        })
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub async fn fetch(&self, did: &str) -> Result<FetchedRepo, MirrorError> {
        match self.fetch_inner(did).await {
            Ok(repo) => {
                metrics::FETCHER_REPOS_FETCHED_TOTAL.inc();
                Ok(repo)
            }
            Err(e) => {
                metrics::FETCHER_REPO_ERRORS_TOTAL.inc();
                if matches!(e, MirrorError::Verification(_)) {
                    metrics::FETCHER_VERIFICATION_ERRORS_TOTAL.inc();
                }
                Err(e)
            }
        }
    }

    async fn fetch_inner(&self, did: &str) -> Result<FetchedRepo, MirrorError> {
        let identity = self.resolver.resolve(did).await?;
        // an unusable key fails before the download
        repo::signing_key_alg(&identity.signing_key)?;

        let url = format!(
            "{}/xrpc/com.atproto.sync.getRepo",
            identity.pds.trim_end_matches('/')
        );
        let response = self.client.get(&url).query(&[("did", did)]).send().await?;
        if !response.status().is_success() {
            return Err(MirrorError::Repo(format!(
                "getRepo for {did} returned {}",
                response.status()
            )));
        }
        let car_bytes = http::read_body_capped(response, self.max_bytes).await?;

        let verified = repo::load_verified(car_bytes, did, &identity.signing_key).await?;

        let mut records = Vec::with_capacity(verified.entries.len());
        let mut unsupported = 0usize;
        for entry in verified.entries {
            let uri = match AtUri::from_repo_path(did, &entry.path) {
                Ok(uri) => uri,
                Err(e) => {
                    tracing::warn!("skipping repo entry {} in {did}: {e}", entry.path);
                    continue;
                }
            };
            if Collection::from_nsid(uri.collection()).is_none() {
                unsupported += 1;
                continue;
            }
            match Record::new(uri, entry.cid.to_string(), entry.value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("skipping invalid record {} in {did}: {e}", entry.path),
            }
        }
        tracing::debug!(
            "fetched repo {did} rev {}: {} records, {unsupported} in unsupported collections",
            verified.commit.rev,
            records.len()
        );

        Ok(FetchedRepo {
            identity,
            rev: verified.commit.rev,
            records,
        })
    }
}
