//! One worker per named queue, each running up to `concurrency` jobs at a
//! time. There is no lock across queues.

pub mod handlers;

#[cfg(test)]
mod tests;

use crate::SHUTDOWN;
use crate::queue::{FailOutcome, Job, JobContext, JobQueue};
use crate::types::MirrorError;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub use handlers::{
    ActorStatsHandler, BackfillHandler, FetchRecordHandler, JobHandler, PostStatsHandler,
    ResolveDidHandler,
};

/// Upper bound on how long an idle worker sleeps before re-checking delayed
/// jobs and the shutdown flag.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// What happened to a job after its handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Completed,
    /// The item was abandoned; the job still completed.
    Skipped(String),
    Retrying,
    DeadLettered,
}

pub struct Worker {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
}

impl Worker {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>, concurrency: usize) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        match self.queue.recover_stalled() {
            Ok(0) => {}
            Ok(n) => tracing::info!("queue {}: recovered {n} stalled jobs", self.queue.name()),
            Err(e) => tracing::error!("queue {}: failed to recover stalled jobs: {e}", self.queue.name()),
        }
        tracing::info!(
            "worker for {} started with concurrency {}",
            self.queue.name(),
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        loop {
            if SHUTDOWN.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested for {} worker", self.queue.name());
                break;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            match self.queue.next_ready() {
                Ok(Some(job)) => {
                    let queue = self.queue.clone();
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        process(&queue, handler.as_ref(), job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if let Err(e) = self.queue.counts() {
                        tracing::warn!("queue {}: failed to read counts: {e}", self.queue.name());
                    }
                    self.queue.wait_for_work(IDLE_WAIT).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!("queue {}: failed to dequeue: {e}", self.queue.name());
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        // let running jobs finish so none is left active
        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;
        tracing::info!("worker for {} stopped", self.queue.name());
    }
}

/// Runs `job` through `handler` and settles it in `queue`.
pub async fn process(queue: &JobQueue, handler: &dyn JobHandler, job: Job) -> JobResult {
    let ctx = JobContext::new(queue.clone(), job);
    let result = handler.handle(&ctx).await;
    let job = ctx.job();

    let outcome = match result {
        Ok(()) => Ok(JobResult::Completed),
        Err(e) if e.is_skippable() => {
            ctx.log(format!("skipped: {e}"));
            Ok(JobResult::Skipped(e.to_string()))
        }
        Err(e) => {
            if e.is_fatal() {
                tracing::error!("queue {} job {} hit a fatal error: {e}", queue.name(), job.id);
            } else {
                tracing::warn!("queue {} job {} failed: {e}", queue.name(), job.id);
            }
            Err(e)
        }
    };

    match outcome {
        Ok(result) => match queue.complete(job) {
            Ok(()) => result,
            Err(e) => settle_error(queue, job, &e),
        },
        Err(e) => match queue.fail(job, &e.to_string()) {
            Ok(FailOutcome::Retrying { .. }) => JobResult::Retrying,
            Ok(FailOutcome::DeadLettered) => JobResult::DeadLettered,
            Err(e) => settle_error(queue, job, &e),
        },
    }
}

fn settle_error(queue: &JobQueue, job: &Job, e: &MirrorError) -> JobResult {
    // the job stays active and is picked up again by recover_stalled
    tracing::error!("queue {}: failed to settle job {}: {e}", queue.name(), job.id);
    JobResult::Retrying
}
