use crate::backfill::BackfillOrchestrator;
use crate::config::MAX_FETCH_DEPTH;
use crate::db::Database;
use crate::fetcher::RecordFetcher;
use crate::identity::IdentityResolver;
use crate::indexing::{IndexContext, IndexOutcome, IndexingService};
use crate::lexicon::Collection;
use crate::metrics;
use crate::queue::JobContext;
use crate::scheduler::{ActorStatsJob, BackfillJob, FetchRecordJob, PostStatsJob};
use crate::types::MirrorError;
use crate::uri::AtUri;
use async_trait::async_trait;
use std::sync::Arc;

/// Runs one job. Skippable errors are absorbed by the worker, everything
/// else goes back to the queue for retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobContext) -> Result<(), MirrorError>;
}

pub struct FetchRecordHandler {
    indexing: Arc<IndexingService>,
    fetcher: Arc<RecordFetcher>,
}

impl FetchRecordHandler {
    pub fn new(indexing: Arc<IndexingService>, fetcher: Arc<RecordFetcher>) -> Self {
        Self { indexing, fetcher }
    }
}

#[async_trait]
impl JobHandler for FetchRecordHandler {
    async fn handle(&self, job: &JobContext) -> Result<(), MirrorError> {
        let FetchRecordJob { uri, depth, live } = job.data()?;
        if depth >= MAX_FETCH_DEPTH {
            metrics::FETCHER_DEPTH_SKIPPED_TOTAL.inc();
            job.log(format!("{uri} is at depth {depth}, not fetching"));
            return Ok(());
        }

        let uri = AtUri::parse(&uri)?;
        if Collection::from_nsid(uri.collection()).is_none() {
            metrics::FETCHER_UNSUPPORTED_SKIPPED_TOTAL.inc();
            job.log(format!("{uri} is not in a supported collection, not fetching"));
            return Ok(());
        }
        let record = self.fetcher.fetch(&uri).await?;
        match self
            .indexing
            .index_record(&record, IndexContext::fetched(depth, live))
            .await?
        {
            IndexOutcome::Skipped(reason) => {
                job.log(format!("fetched {uri} but skipped it: {}", reason.as_str()));
            }
            IndexOutcome::Indexed | IndexOutcome::Deleted => {}
        }
        Ok(())
    }
}

pub struct ResolveDidHandler {
    resolver: Arc<dyn IdentityResolver>,
    db: Arc<dyn Database>,
}

impl ResolveDidHandler {
    pub fn new(resolver: Arc<dyn IdentityResolver>, db: Arc<dyn Database>) -> Self {
        Self { resolver, db }
    }
}

#[async_trait]
impl JobHandler for ResolveDidHandler {
    async fn handle(&self, job: &JobContext) -> Result<(), MirrorError> {
        let did: String = job.data()?;
        let identity = self.resolver.resolve(&did).await?;
        if identity.handle.is_none() {
            job.log(format!("{did} has no handle in its did document"));
        }
        self.db.upsert_actor(&did, identity.handle.as_deref()).await
    }
}

pub struct BackfillHandler {
    orchestrator: Arc<BackfillOrchestrator>,
}

impl BackfillHandler {
    pub fn new(orchestrator: Arc<BackfillOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for BackfillHandler {
    async fn handle(&self, job: &JobContext) -> Result<(), MirrorError> {
        let BackfillJob {
            did,
            target_collections,
        } = job.data()?;
        self.orchestrator
            .run(&did, &target_collections, Some(job))
            .await?;
        Ok(())
    }
}

pub struct PostStatsHandler {
    db: Arc<dyn Database>,
}

impl PostStatsHandler {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobHandler for PostStatsHandler {
    async fn handle(&self, job: &JobContext) -> Result<(), MirrorError> {
        let PostStatsJob { uri, stat } = job.data()?;
        let count = self.db.refresh_post_stat(&uri, stat).await?;
        tracing::debug!("{} count for {uri} is now {count}", stat.as_str());
        Ok(())
    }
}

pub struct ActorStatsHandler {
    db: Arc<dyn Database>,
}

impl ActorStatsHandler {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobHandler for ActorStatsHandler {
    async fn handle(&self, job: &JobContext) -> Result<(), MirrorError> {
        let ActorStatsJob { did, stat } = job.data()?;
        let count = self.db.refresh_actor_stat(&did, stat).await?;
        tracing::debug!("{} count for {did} is now {count}", stat.as_str());
        Ok(())
    }
}
