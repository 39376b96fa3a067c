//! Typed facade over the job queues.
//!
//! Components that enqueue work depend on [`JobScheduler`] only. Each intent
//! becomes a [`JobRequest`] carrying its idempotency key, priority tier and
//! debounce delay; the queue behind it is an implementation detail.

use crate::config::{
    JOB_BACKOFF_BASE, JOB_MAX_ATTEMPTS, PRIORITY_BACKGROUND, PRIORITY_LIVE, STATS_DEBOUNCE_DELAY,
};
use crate::db::{ActorStat, PostStat};
use crate::lexicon::Collection;
use crate::queue::{JobOptions, JobQueue, JobRequest, QueueOptions, QueueStore};
use crate::types::MirrorError;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

pub const FETCH_RECORD_QUEUE: &str = "fetchRecord";
pub const RESOLVE_DID_QUEUE: &str = "resolveDid";
pub const BACKFILL_QUEUE: &str = "backfill";
pub const AGGREGATE_POST_STATS_QUEUE: &str = "aggregatePostStats";
pub const AGGREGATE_ACTOR_STATS_QUEUE: &str = "aggregateActorStats";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRecordJob {
    pub uri: String,
    pub depth: u32,
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillJob {
    pub did: String,
    pub target_collections: Vec<Collection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostStatsJob {
    pub uri: String,
    #[serde(rename = "type")]
    pub stat: PostStat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorStatsJob {
    pub did: String,
    #[serde(rename = "type")]
    pub stat: ActorStat,
}

/// A second fetch of a pending uri keeps the shallower depth and stays live
/// if either request was live.
pub fn merge_fetch_record(
    existing: &serde_json::Value,
    incoming: &serde_json::Value,
) -> serde_json::Value {
    let (Ok(mut current), Ok(next)) = (
        serde_json::from_value::<FetchRecordJob>(existing.clone()),
        serde_json::from_value::<FetchRecordJob>(incoming.clone()),
    ) else {
        return existing.clone();
    };
    current.depth = current.depth.min(next.depth);
    current.live |= next.live;
    serde_json::to_value(&current).unwrap_or_else(|_| existing.clone())
}

fn to_value<T: Serialize>(data: &T) -> Result<serde_json::Value, MirrorError> {
    serde_json::to_value(data).map_err(|e| MirrorError::Serialization(e.to_string()))
}

fn debounce_ms() -> u64 {
    u64::try_from(STATS_DEBOUNCE_DELAY.as_millis()).unwrap_or(u64::MAX)
}

pub fn fetch_record_request(uri: &str, depth: u32, live: bool) -> Result<JobRequest, MirrorError> {
    Ok(JobRequest {
        queue_name: FETCH_RECORD_QUEUE.to_owned(),
        job_name: FETCH_RECORD_QUEUE.to_owned(),
        data: to_value(&FetchRecordJob {
            uri: uri.to_owned(),
            depth,
            live,
        })?,
        options: JobOptions {
            job_id: Some(uri.to_owned()),
            priority: Some(if live { PRIORITY_LIVE } else { PRIORITY_BACKGROUND }),
            delay: None,
        },
    })
}

#[must_use]
pub fn resolve_did_request(did: &str) -> JobRequest {
    JobRequest {
        queue_name: RESOLVE_DID_QUEUE.to_owned(),
        job_name: RESOLVE_DID_QUEUE.to_owned(),
        data: serde_json::Value::String(did.to_owned()),
        options: JobOptions {
            job_id: Some(did.to_owned()),
            priority: Some(PRIORITY_BACKGROUND),
            delay: None,
        },
    }
}

pub fn backfill_request(did: &str, collections: &[Collection]) -> Result<JobRequest, MirrorError> {
    Ok(JobRequest {
        queue_name: BACKFILL_QUEUE.to_owned(),
        job_name: BACKFILL_QUEUE.to_owned(),
        data: to_value(&BackfillJob {
            did: did.to_owned(),
            target_collections: collections.to_vec(),
        })?,
        options: JobOptions {
            job_id: Some(did.to_owned()),
            priority: Some(PRIORITY_BACKGROUND),
            delay: None,
        },
    })
}

pub fn post_stats_request(uri: &str, stat: PostStat) -> Result<JobRequest, MirrorError> {
    Ok(JobRequest {
        queue_name: AGGREGATE_POST_STATS_QUEUE.to_owned(),
        job_name: AGGREGATE_POST_STATS_QUEUE.to_owned(),
        data: to_value(&PostStatsJob {
            uri: uri.to_owned(),
            stat,
        })?,
        options: JobOptions {
            job_id: Some(format!("{}:{uri}", stat.as_str())),
            priority: None,
            delay: Some(debounce_ms()),
        },
    })
}

pub fn actor_stats_request(did: &str, stat: ActorStat) -> Result<JobRequest, MirrorError> {
    Ok(JobRequest {
        queue_name: AGGREGATE_ACTOR_STATS_QUEUE.to_owned(),
        job_name: AGGREGATE_ACTOR_STATS_QUEUE.to_owned(),
        data: to_value(&ActorStatsJob {
            did: did.to_owned(),
            stat,
        })?,
        options: JobOptions {
            job_id: Some(format!("{}:{did}", stat.as_str())),
            priority: None,
            delay: Some(debounce_ms()),
        },
    })
}

/// Domain intents that become queued jobs.
///
/// Implementors only provide [`JobScheduler::submit`]; the typed methods
/// encode keys, priorities and delays.
pub trait JobScheduler: Send + Sync {
    fn submit(&self, request: JobRequest) -> Result<(), MirrorError>;

    /// Keyed by uri. `live` selects the top priority tier.
    fn fetch_record(&self, uri: &str, depth: u32, live: bool) -> Result<(), MirrorError> {
        self.submit(fetch_record_request(uri, depth, live)?)
    }

    /// Keyed by did.
    fn resolve_did(&self, did: &str) -> Result<(), MirrorError> {
        self.submit(resolve_did_request(did))
    }

    /// Keyed by did.
    fn backfill(&self, did: &str, collections: &[Collection]) -> Result<(), MirrorError> {
        self.submit(backfill_request(did, collections)?)
    }

    /// Debounced; keyed by stat type and post uri.
    fn aggregate_post_stats(&self, uri: &str, stat: PostStat) -> Result<(), MirrorError> {
        self.submit(post_stats_request(uri, stat)?)
    }

    /// Debounced; keyed by stat type and did.
    fn aggregate_actor_stats(&self, did: &str, stat: ActorStat) -> Result<(), MirrorError> {
        self.submit(actor_stats_request(did, stat)?)
    }
}

/// The five job queues, opened from one store.
#[derive(Clone)]
pub struct Queues {
    pub fetch_record: JobQueue,
    pub resolve_did: JobQueue,
    pub backfill: JobQueue,
    pub aggregate_post_stats: JobQueue,
    pub aggregate_actor_stats: JobQueue,
}

impl Queues {
    pub fn open(store: &QueueStore) -> Result<Self, MirrorError> {
        let options = QueueOptions {
            max_attempts: *JOB_MAX_ATTEMPTS,
            backoff_base: *JOB_BACKOFF_BASE,
            merge: None,
        };
        let fetch_options = QueueOptions {
            merge: Some(merge_fetch_record),
            ..options
        };
        Ok(Self {
            fetch_record: store.queue(FETCH_RECORD_QUEUE, fetch_options)?,
            resolve_did: store.queue(RESOLVE_DID_QUEUE, options)?,
            backfill: store.queue(BACKFILL_QUEUE, options)?,
            aggregate_post_stats: store.queue(AGGREGATE_POST_STATS_QUEUE, options)?,
            aggregate_actor_stats: store.queue(AGGREGATE_ACTOR_STATS_QUEUE, options)?,
        })
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&JobQueue> {
        match name {
            FETCH_RECORD_QUEUE => Some(&self.fetch_record),
            RESOLVE_DID_QUEUE => Some(&self.resolve_did),
            BACKFILL_QUEUE => Some(&self.backfill),
            AGGREGATE_POST_STATS_QUEUE => Some(&self.aggregate_post_stats),
            AGGREGATE_ACTOR_STATS_QUEUE => Some(&self.aggregate_actor_stats),
            _ => None,
        }
    }

    #[must_use]
    pub fn all(&self) -> [&JobQueue; 5] {
        [
            &self.fetch_record,
            &self.resolve_did,
            &self.backfill,
            &self.aggregate_post_stats,
            &self.aggregate_actor_stats,
        ]
    }
}

/// Scheduler backed by the durable queues.
#[derive(Clone)]
pub struct QueueScheduler {
    queues: Queues,
}

impl QueueScheduler {
    #[must_use]
    pub const fn new(queues: Queues) -> Self {
        Self { queues }
    }
}

impl JobScheduler for QueueScheduler {
    fn submit(&self, request: JobRequest) -> Result<(), MirrorError> {
        let queue = self.queues.by_name(&request.queue_name).ok_or_else(|| {
            MirrorError::Other(format!("unknown queue: {}", request.queue_name))
        })?;
        let outcome = queue.add(&request.job_name, request.data, &request.options)?;
        tracing::debug!(
            "{} {:?}: {}",
            request.queue_name,
            outcome,
            request.options.job_id.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}

/// Scheduler that keeps every request in memory instead of queueing it.
#[derive(Default)]
pub struct MemoryScheduler {
    requests: Mutex<Vec<JobRequest>>,
}

impl MemoryScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<JobRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests submitted to `queue`, oldest first.
    #[must_use]
    pub fn submitted_to(&self, queue: &str) -> Vec<JobRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.queue_name == queue)
            .collect()
    }

    /// Drains everything submitted so far.
    pub fn take(&self) -> Vec<JobRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl JobScheduler for MemoryScheduler {
    fn submit(&self, request: JobRequest) -> Result<(), MirrorError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(())
    }
}
