//! Ordered live dispatch. Events are split over a fixed set of workers by
//! repo DID, so two events for one repo are always indexed in stream order,
//! while different repos proceed in parallel.

use super::{ParseResult, handle_event, log_index_error};
use crate::SHUTDOWN;
use crate::config::{INGESTER_RETRY_ATTEMPTS, INGESTER_RETRY_BASE, INGESTER_SHARD_BUFFER};
use crate::indexing::IndexingService;
use crate::metrics;
use crate::types::MirrorError;
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

struct Task {
    time_us: i64,
    result: ParseResult,
}

#[derive(Default)]
struct TrackerState {
    in_flight: BTreeMap<i64, usize>,
    seen: Option<i64>,
}

/// Stream positions handed out but not yet settled.
#[derive(Default)]
pub struct CursorTracker {
    state: Mutex<TrackerState>,
}

impl CursorTracker {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a position that needs no work.
    pub fn observe(&self, time_us: i64) {
        let mut state = self.lock();
        state.seen = Some(state.seen.map_or(time_us, |s| s.max(time_us)));
    }

    pub fn begin(&self, time_us: i64) {
        let mut state = self.lock();
        *state.in_flight.entry(time_us).or_insert(0) += 1;
        state.seen = Some(state.seen.map_or(time_us, |s| s.max(time_us)));
    }

    pub fn finish(&self, time_us: i64) {
        let mut state = self.lock();
        if let Some(count) = state.in_flight.get_mut(&time_us) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&time_us);
            }
        }
    }

    /// The newest position at or before which every event has settled.
    /// Resuming from it replays at most the events still in flight.
    pub fn settled(&self) -> Option<i64> {
        let state = self.lock();
        match state.in_flight.keys().next() {
            Some(oldest) => Some(oldest - 1),
            None => state.seen,
        }
    }
}

fn shard_for(did: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    did.hash(&mut hasher);
    usize::try_from(hasher.finish() % shards as u64).unwrap_or(0)
}

const fn is_retryable(e: &MirrorError) -> bool {
    !e.is_skippable() && !e.is_fatal()
}

fn retry_delay(attempt: u32) -> Duration {
    INGESTER_RETRY_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_RETRY_DELAY)
}

pub struct ShardedDispatcher {
    senders: Vec<mpsc::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    tracker: Arc<CursorTracker>,
}

impl ShardedDispatcher {
    pub fn new(indexing: Arc<IndexingService>, shards: usize) -> Self {
        let shards = shards.max(1);
        let tracker = Arc::new(CursorTracker::default());
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel(*INGESTER_SHARD_BUFFER);
            workers.push(tokio::spawn(run_shard(
                shard,
                rx,
                Arc::clone(&indexing),
                Arc::clone(&tracker),
            )));
            senders.push(tx);
        }
        Self {
            senders,
            workers,
            tracker,
        }
    }

    /// Queues the event behind earlier events of the same repo. Waits when
    /// that shard is full, which backs pressure up into the socket.
    pub async fn dispatch(&self, time_us: i64, result: ParseResult) {
        let did = match &result {
            ParseResult::Commit(event) => event.did.as_str(),
            ParseResult::Identity(event) => event.did.as_str(),
            ParseResult::Filtered | ParseResult::Skip => {
                self.tracker.observe(time_us);
                return;
            }
        };
        let shard = shard_for(did, self.senders.len());
        let Some(sender) = self.senders.get(shard) else {
            return;
        };
        self.tracker.begin(time_us);
        // a closed shard leaves the position unsettled, so it is replayed
        if sender.send(Task { time_us, result }).await.is_err() {
            metrics::INGESTER_ERRORS_TOTAL
                .with_label_values(&["dispatch"])
                .inc();
            tracing::error!("ingester shard {shard} is closed");
        }
    }

    #[must_use]
    pub fn settled(&self) -> Option<i64> {
        self.tracker.settled()
    }

    /// Closes every shard, waits for queued events and returns the final
    /// settled position.
    pub async fn drain(self) -> Option<i64> {
        drop(self.senders);
        for worker in self.workers {
            drop(worker.await);
        }
        self.tracker.settled()
    }
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<Task>,
    indexing: Arc<IndexingService>,
    tracker: Arc<CursorTracker>,
) {
    while let Some(task) = rx.recv().await {
        if index_with_retry(&indexing, task.result).await {
            tracker.finish(task.time_us);
        }
    }
    tracing::debug!("ingester shard {shard} drained");
}

/// Returns false when shutdown interrupted the retries; the event then stays
/// unsettled and is replayed from the saved cursor.
async fn index_with_retry(indexing: &IndexingService, result: ParseResult) -> bool {
    let attempts = *INGESTER_RETRY_ATTEMPTS;
    let mut attempt = 1;
    loop {
        match handle_event(indexing, result.clone()).await {
            Ok(_) => return true,
            Err(e) if is_retryable(&e) && attempt < attempts => {
                if SHUTDOWN.load(Ordering::Relaxed) {
                    tracing::info!("leaving live event for replay at shutdown: {e}");
                    return false;
                }
                metrics::INGESTER_RETRIES_TOTAL.inc();
                let delay = retry_delay(attempt);
                tracing::warn!(
                    "live event failed (attempt {attempt}/{attempts}), retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if is_retryable(&e) {
                    metrics::INGESTER_DROPPED_EVENTS_TOTAL.inc();
                }
                log_index_error(&e);
                return true;
            }
        }
    }
}
