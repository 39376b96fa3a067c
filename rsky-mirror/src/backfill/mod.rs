//! Full-repository import for newly subscribed actors.
//!
//! An actor moves `dirty -> in-process -> synchronized`. Each chunk of
//! records commits in its own transaction, so a failure part-way through
//! keeps the chunks already written and the queue retry re-imports the rest
//! (every write is an idempotent upsert).


use crate::config::{BACKFILL_CHUNK_SIZE, BACKFILL_VERIFICATION_FAILURE, VerificationFailurePolicy};
use crate::db::BackfillStatus;
use crate::fetcher::RepoFetcher;
use crate::indexing::{IndexContext, IndexingService};
use crate::lexicon::Collection;
use crate::metrics;
use crate::queue::JobContext;
use crate::record::Record;
use crate::types::MirrorError;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// The actor was already synchronized; nothing was fetched.
    AlreadySynchronized,
    Completed {
        imported: usize,
        skipped: usize,
        chunks: usize,
    },
}

pub struct BackfillOrchestrator {
    indexing: Arc<IndexingService>,
    repos: Arc<RepoFetcher>,
    chunk_size: usize,
    failure_policy: VerificationFailurePolicy,
}

impl BackfillOrchestrator {
    pub fn new(indexing: Arc<IndexingService>, repos: Arc<RepoFetcher>) -> Self {
        Self {
            indexing,
            repos,
            chunk_size: *BACKFILL_CHUNK_SIZE,
            failure_policy: *BACKFILL_VERIFICATION_FAILURE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub const fn with_failure_policy(mut self, policy: VerificationFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Imports every record of `did` in `targets`. Progress lines go to the
    /// job log when `job` is given.
    pub async fn run(
        &self,
        did: &str,
        targets: &[Collection],
        job: Option<&JobContext>,
    ) -> Result<BackfillOutcome, MirrorError> {
        let db = self.indexing.db();
        if let Some(actor) = db.actor(did).await? {
            if actor.backfill_status == BackfillStatus::Synchronized {
                note(job, format!("{did} is already synchronized, skipping backfill"));
                return Ok(BackfillOutcome::AlreadySynchronized);
            }
        }

        db.set_backfill_status(did, BackfillStatus::InProcess).await?;
        metrics::BACKFILL_REPOS_RUNNING.inc();
        let result = self.import(did, targets, job).await;
        metrics::BACKFILL_REPOS_RUNNING.dec();

        match result {
            Ok(outcome) => {
                db.set_backfill_status(did, BackfillStatus::Synchronized).await?;
                metrics::BACKFILL_REPOS_COMPLETED_TOTAL.inc();
                Ok(outcome)
            }
            Err(e) => {
                metrics::BACKFILL_REPOS_FAILED_TOTAL.inc();
                note(job, format!("backfill failed for {did}: {e}"));
                if self.failure_policy == VerificationFailurePolicy::RevertToDirty {
                    db.set_backfill_status(did, BackfillStatus::Dirty).await?;
                }
                Err(e)
            }
        }
    }

    async fn import(
        &self,
        did: &str,
        targets: &[Collection],
        job: Option<&JobContext>,
    ) -> Result<BackfillOutcome, MirrorError> {
        let started = Instant::now();
        let repo = self.repos.fetch(did).await?;
        let total = repo.records.len();
        let records: Vec<Record> = repo
            .records
            .into_iter()
            .filter(|r| targets.contains(&r.collection()))
            .collect();
        note(
            job,
            format!(
                "fetched {did} at rev {} in {:?}: {} of {total} records in target collections",
                repo.rev,
                started.elapsed(),
                records.len()
            ),
        );

        if let Some(handle) = repo.identity.handle.as_deref() {
            self.indexing.db().upsert_actor(did, Some(handle)).await?;
        }

        let chunks = records.len().div_ceil(self.chunk_size);
        let mut imported = 0;
        let mut skipped = 0;
        for (i, chunk) in records.chunks(self.chunk_size).enumerate() {
            let chunk_started = Instant::now();
            let (written, dropped) = self.import_chunk(chunk, job).await?;
            imported += written;
            skipped += dropped;
            metrics::BACKFILL_CHUNKS_COMMITTED_TOTAL.inc();
            metrics::BACKFILL_RECORDS_IMPORTED_TOTAL.inc_by(written as u64);
            note(
                job,
                format!(
                    "chunk {}/{chunks}: {written} records in {:?}",
                    i + 1,
                    chunk_started.elapsed()
                ),
            );
        }

        note(
            job,
            format!(
                "backfill complete for {did}: {imported} imported, {skipped} skipped, {chunks} chunks in {:?}",
                started.elapsed()
            ),
        );
        Ok(BackfillOutcome::Completed {
            imported,
            skipped,
            chunks,
        })
    }

    /// One transaction per chunk. After-actions run only once it commits.
    async fn import_chunk(
        &self,
        chunk: &[Record],
        job: Option<&JobContext>,
    ) -> Result<(usize, usize), MirrorError> {
        let ctx = IndexContext::backfill();
        let mut admitted = Vec::with_capacity(chunk.len());
        let mut skipped = 0;
        for record in chunk {
            match self.indexing.precheck(record, ctx).await? {
                Some(reason) => {
                    skipped += 1;
                    note(job, format!("skipped {}: {}", record.uri(), reason.as_str()));
                }
                None => admitted.push(record),
            }
        }

        let mut uow = self.indexing.db().begin().await?;
        let mut actions = Vec::new();
        for record in &admitted {
            match self.indexing.index_in(uow.as_mut(), record, ctx).await {
                Ok(mut more) => actions.append(&mut more),
                Err(e) => {
                    if let Err(rollback) = uow.rollback().await {
                        tracing::warn!("rollback failed for backfill chunk: {rollback}");
                    }
                    return Err(e);
                }
            }
        }
        uow.commit().await?;

        for record in &admitted {
            metrics::INDEXER_RECORDS_INDEXED_TOTAL
                .with_label_values(&[record.collection().nsid()])
                .inc();
        }
        self.indexing.run_after_actions(&actions)?;
        Ok((admitted.len(), skipped))
    }
}

fn note(job: Option<&JobContext>, line: String) {
    match job {
        Some(job) => job.log(line),
        None => tracing::info!("{line}"),
    }
}
