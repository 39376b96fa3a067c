//! The index commit service: the single path every write takes, whether it
//! comes from the live feed, an on-demand fetch or a backfill chunk.

pub mod collections;
pub mod policy;
pub mod tracked;


use crate::config::TRACKED_CACHE_TTL;
use crate::db::{Database, RemovedRow, UnitOfWork};
use crate::lexicon::Collection;
use crate::metrics;
use crate::record::Record;
use crate::scheduler::JobScheduler;
use crate::types::{CommitEvent, IdentityEvent, MirrorError, RecordValidationError, WriteAction};
use crate::uri::AtUri;
use std::sync::Arc;

pub use collections::AfterAction;
pub use tracked::TrackedCache;

/// How a record reached the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexContext {
    /// Skip the admission policy. Fetch and backfill paths are already
    /// scoped to relevant actors.
    pub force: bool,
    /// Fetch hops taken to reach this record; discovered references are
    /// fetched at `depth + 1`.
    pub depth: u32,
    /// Arrived from live traffic rather than bulk import.
    pub live: bool,
}

impl IndexContext {
    #[must_use]
    pub const fn live() -> Self {
        Self {
            force: false,
            depth: 0,
            live: true,
        }
    }

    #[must_use]
    pub const fn fetched(depth: u32, live: bool) -> Self {
        Self {
            force: true,
            depth,
            live,
        }
    }

    #[must_use]
    pub const fn backfill() -> Self {
        Self {
            force: true,
            depth: 0,
            live: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NulByte,
    Policy,
}

impl SkipReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NulByte => "nul_byte",
            Self::Policy => "policy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed,
    Skipped(SkipReason),
    Deleted,
}

pub struct IndexingService {
    db: Arc<dyn Database>,
    scheduler: Arc<dyn JobScheduler>,
    tracked: TrackedCache,
    service_did: Option<String>,
}

impl IndexingService {
    /// `service_did` restricts which subscriptions trigger a backfill; `None`
    /// accepts every subscription.
    pub fn new(
        db: Arc<dyn Database>,
        scheduler: Arc<dyn JobScheduler>,
        service_did: Option<String>,
    ) -> Self {
        Self {
            db,
            scheduler,
            tracked: TrackedCache::new(*TRACKED_CACHE_TTL),
            service_did,
        }
    }

    #[must_use]
    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn JobScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub const fn tracked(&self) -> &TrackedCache {
        &self.tracked
    }

    /// Admits and writes one record in its own transaction, then runs its
    /// after-actions.
    pub async fn index_record(
        &self,
        record: &Record,
        ctx: IndexContext,
    ) -> Result<IndexOutcome, MirrorError> {
        if let Some(reason) = self.precheck(record, ctx).await? {
            return Ok(IndexOutcome::Skipped(reason));
        }

        let mut uow = self.db.begin().await?;
        let actions = match self.index_in(uow.as_mut(), record, ctx).await {
            Ok(actions) => actions,
            Err(e) => {
                metrics::INDEXER_RECORDS_FAILED_TOTAL.inc();
                if let Err(rollback) = uow.rollback().await {
                    tracing::warn!("rollback failed for {}: {rollback}", record.uri());
                }
                return Err(e);
            }
        };
        uow.commit().await?;

        metrics::INDEXER_RECORDS_INDEXED_TOTAL
            .with_label_values(&[record.collection().nsid()])
            .inc();
        self.run_after_actions(&actions)?;
        Ok(IndexOutcome::Indexed)
    }

    /// NUL and policy checks. Returns the reason when the record must not be
    /// written.
    pub async fn precheck(
        &self,
        record: &Record,
        ctx: IndexContext,
    ) -> Result<Option<SkipReason>, MirrorError> {
        if record.contains_nul() {
            tracing::warn!("{} contains a NUL character, skipping", record.uri());
            metrics::INDEXER_RECORDS_SKIPPED_TOTAL
                .with_label_values(&[SkipReason::NulByte.as_str()])
                .inc();
            return Ok(Some(SkipReason::NulByte));
        }
        if !ctx.force && !policy::should_index(&*self.db, &self.tracked, record).await? {
            tracing::debug!("{} does not match storage rules, skipping", record.uri());
            metrics::INDEXER_RECORDS_SKIPPED_TOTAL
                .with_label_values(&[SkipReason::Policy.as_str()])
                .inc();
            return Ok(Some(SkipReason::Policy));
        }
        Ok(None)
    }

    /// Writes actor, raw record and collection row inside `uow`. The caller
    /// owns the transaction and runs the returned actions after committing.
    pub async fn index_in(
        &self,
        uow: &mut dyn UnitOfWork,
        record: &Record,
        ctx: IndexContext,
    ) -> Result<Vec<AfterAction>, MirrorError> {
        uow.upsert_actor(record.author(), None).await?;
        uow.upsert_record(record).await?;
        collections::upsert(uow, record).await?;
        collections::after_actions(&*uow, record, ctx, self.service_did.as_deref()).await
    }

    pub fn run_after_actions(&self, actions: &[AfterAction]) -> Result<(), MirrorError> {
        for action in actions {
            match action {
                AfterAction::PostStats { uri, stat } => {
                    self.scheduler.aggregate_post_stats(uri, *stat)?;
                }
                AfterAction::ActorStats { did, stat } => {
                    self.scheduler.aggregate_actor_stats(did, *stat)?;
                }
                AfterAction::FetchRecord { uri, depth, live } => {
                    self.scheduler.fetch_record(uri, *depth, *live)?;
                }
                AfterAction::ResolveDid { did } => self.scheduler.resolve_did(did)?,
                AfterAction::Backfill { did } => {
                    tracing::info!("subscription from {did}, scheduling backfill");
                    self.scheduler.backfill(did, &Collection::ALL)?;
                }
                AfterAction::Track { did } => self.tracked.insert(did),
                AfterAction::Untrack { did } => self.tracked.invalidate(did),
                AfterAction::ForgetTracked => self.tracked.clear(),
            }
        }
        Ok(())
    }

    /// Removes the raw record and its collection row in one transaction.
    pub async fn delete_record(&self, uri: &AtUri) -> Result<Option<RemovedRow>, MirrorError> {
        let collection = Collection::from_nsid(uri.collection())
            .ok_or_else(|| MirrorError::UnsupportedCollection(uri.collection().to_owned()))?;

        let mut uow = self.db.begin().await?;
        let removed = match uow.delete_record(uri, collection).await {
            Ok(removed) => removed,
            Err(e) => {
                if let Err(rollback) = uow.rollback().await {
                    tracing::warn!("rollback failed for {uri}: {rollback}");
                }
                return Err(e);
            }
        };
        uow.commit().await?;

        if let Some(row) = &removed {
            metrics::INDEXER_RECORDS_DELETED_TOTAL.inc();
            self.run_after_actions(&collections::removal_actions(row))?;
        }
        Ok(removed)
    }

    /// Entry point for a live commit event.
    pub async fn handle_commit_event(
        &self,
        event: CommitEvent,
    ) -> Result<IndexOutcome, MirrorError> {
        let collection = Collection::from_nsid(&event.collection)
            .ok_or_else(|| MirrorError::UnsupportedCollection(event.collection.clone()))?;
        let uri = AtUri::new(&event.did, &event.collection, &event.rkey)?;

        match event.operation {
            WriteAction::Delete => {
                self.delete_record(&uri).await?;
                Ok(IndexOutcome::Deleted)
            }
            WriteAction::Create | WriteAction::Update => {
                let (Some(json), Some(cid)) = (event.record, event.cid) else {
                    return Err(RecordValidationError {
                        collection: collection.nsid().to_owned(),
                        reason: format!("{} commit for {uri} carries no record", event.operation.as_str()),
                    }
                    .into());
                };
                let record = Record::new(uri, cid, json)?;
                self.index_record(&record, IndexContext::live()).await
            }
        }
    }

    /// Upserts the actor; without a handle in the event, schedules resolution.
    pub async fn handle_identity_event(&self, event: &IdentityEvent) -> Result<(), MirrorError> {
        self.db
            .upsert_actor(&event.did, event.handle.as_deref())
            .await?;
        if event.handle.is_none() {
            self.scheduler.resolve_did(&event.did)?;
        }
        Ok(())
    }
}
