//! Jetstream consumer. Turns the JSON event stream into identity and commit
//! events for the index commit service.

mod shards;
#[cfg(test)]
mod tests;

pub use shards::{CursorTracker, ShardedDispatcher};

use crate::SHUTDOWN;
use crate::config::{CURSOR_SAVE_INTERVAL, INGESTER_SHARDS, JETSTREAM_PING_INTERVAL};
use crate::indexing::{IndexOutcome, IndexingService};
use crate::lexicon::Collection;
use crate::metrics;
use crate::queue::QueueStore;
use crate::types::{CommitEvent, IdentityEvent, MirrorError, WriteAction};
use futures::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug)]
enum ConnectionResult {
    Closed,
    Shutdown,
    Error(MirrorError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    Commit(CommitEvent),
    Identity(IdentityEvent),
    /// A commit in a collection this instance does not index.
    Filtered,
    Skip,
}

/// One decoded Jetstream message with its `time_us` cursor position.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub time_us: i64,
    pub result: ParseResult,
}

#[derive(Deserialize)]
struct RawEvent {
    did: String,
    time_us: i64,
    kind: String,
    #[serde(default)]
    commit: Option<RawCommit>,
    #[serde(default)]
    identity: Option<RawIdentity>,
}

#[derive(Deserialize)]
struct RawCommit {
    operation: WriteAction,
    collection: String,
    rkey: String,
    #[serde(default)]
    record: Option<serde_json::Value>,
    #[serde(default)]
    cid: Option<String>,
}

#[derive(Deserialize)]
struct RawIdentity {
    #[serde(default)]
    handle: Option<String>,
}

pub struct Ingester {
    hosts: Vec<String>,
    indexing: Arc<IndexingService>,
    store: QueueStore,
    shards: usize,
}

impl Ingester {
    pub fn new(hosts: Vec<String>, indexing: Arc<IndexingService>, store: QueueStore) -> Self {
        Self {
            hosts,
            indexing,
            store,
            shards: *INGESTER_SHARDS,
        }
    }

    /// One connection per host until shutdown.
    pub async fn run(self) {
        let this = Arc::new(self);
        let mut tasks = Vec::new();
        for host in &this.hosts {
            let ingester = Arc::clone(&this);
            let host = host.clone();
            tasks.push(tokio::spawn(async move {
                ingester.run_connection(host).await;
            }));
        }
        for task in tasks {
            drop(task.await);
        }
    }

    async fn run_connection(&self, host: String) {
        // 1s, 2s, 4s ... 60s
        let max_backoff_secs = 60u64;
        let mut backoff_secs = 1u64;

        loop {
            if SHUTDOWN.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested for {host}");
                break;
            }

            match self.connect_and_stream(&host).await {
                ConnectionResult::Shutdown => break,
                ConnectionResult::Closed => {
                    tracing::warn!("connection closed for {host}, reconnecting in {backoff_secs}s");
                }
                ConnectionResult::Error(e) => {
                    metrics::INGESTER_ERRORS_TOTAL
                        .with_label_values(&["connection"])
                        .inc();
                    tracing::error!("connection error for {host}: {e}, retrying in {backoff_secs}s");
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(max_backoff_secs);
        }
    }

    async fn connect_and_stream(&self, host: &str) -> ConnectionResult {
        let cursor_key = format!("jetstream:{host}");
        let cursor = match self.store.get_cursor(&cursor_key) {
            Ok(c) => c,
            Err(e) => return ConnectionResult::Error(e),
        };
        let url = match subscribe_url(host, cursor) {
            Ok(u) => u,
            Err(e) => return ConnectionResult::Error(e),
        };
        match cursor {
            Some(c) => tracing::info!("connecting to {url} resuming from cursor {c}"),
            None => tracing::info!("connecting to {url} starting from live stream"),
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(s) => s,
            Err(e) => return ConnectionResult::Error(e.into()),
        };
        metrics::INGESTER_WEBSOCKET_CONNECTIONS.inc();
        let (mut write, mut read) = ws_stream.split();

        let ping_task = tokio::spawn(async move {
            let mut ping_interval = interval(JETSTREAM_PING_INTERVAL);
            loop {
                ping_interval.tick().await;
                if write.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        let dispatcher = ShardedDispatcher::new(Arc::clone(&self.indexing), self.shards);
        let mut last_saved = Instant::now();
        let result = loop {
            if SHUTDOWN.load(Ordering::Relaxed) {
                break ConnectionResult::Shutdown;
            }
            let msg = match read.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => break ConnectionResult::Error(e.into()),
                None => break ConnectionResult::Closed,
            };
            let Message::Text(text) = msg else {
                continue;
            };

            let parsed = match parse_message(&text) {
                Ok(p) => p,
                Err(e) => {
                    metrics::INGESTER_ERRORS_TOTAL
                        .with_label_values(&["parse"])
                        .inc();
                    tracing::warn!("failed to parse jetstream message: {e}");
                    continue;
                }
            };
            dispatcher.dispatch(parsed.time_us, parsed.result).await;

            // only positions whose events have all settled are saved
            if last_saved.elapsed() >= *CURSOR_SAVE_INTERVAL {
                if let Some(time_us) = dispatcher.settled() {
                    self.save_cursor(&cursor_key, time_us);
                }
                last_saved = Instant::now();
            }
        };

        ping_task.abort();
        metrics::INGESTER_WEBSOCKET_CONNECTIONS.dec();
        // the next connection resumes only after this one's events are indexed
        if let Some(time_us) = dispatcher.drain().await {
            self.save_cursor(&cursor_key, time_us);
        }
        result
    }

    fn save_cursor(&self, key: &str, time_us: i64) {
        if let Err(e) = self.store.set_cursor(key, time_us) {
            metrics::INGESTER_ERRORS_TOTAL
                .with_label_values(&["cursor"])
                .inc();
            tracing::error!("failed to save cursor {key}: {e}");
        }
    }
}

/// `wss://{host}/subscribe` asking for the supported collections only. A host
/// given with a `ws://` or `wss://` scheme is used as is.
pub fn subscribe_url(host: &str, cursor: Option<i64>) -> Result<url::Url, MirrorError> {
    let base = if host.starts_with("ws://") || host.starts_with("wss://") {
        host.trim_end_matches('/').to_owned()
    } else {
        let clean = host
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("wss://{clean}")
    };
    let mut url = url::Url::parse(&format!("{base}/subscribe"))
        .map_err(|e| MirrorError::Other(format!("invalid jetstream url {base}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        for collection in Collection::ALL {
            query.append_pair("wantedCollections", collection.nsid());
        }
        if let Some(cursor) = cursor {
            query.append_pair("cursor", &cursor.to_string());
        }
    }
    Ok(url)
}

pub fn parse_message(text: &str) -> Result<ParsedMessage, MirrorError> {
    let raw: RawEvent = serde_json::from_str(text)
        .map_err(|e| MirrorError::Serialization(format!("bad jetstream event: {e}")))?;
    metrics::INGESTER_EVENTS_TOTAL
        .with_label_values(&[raw.kind.as_str()])
        .inc();

    let result = match (raw.kind.as_str(), raw.commit, raw.identity) {
        ("commit", Some(commit), _) => {
            if Collection::from_nsid(&commit.collection).is_none() {
                metrics::INGESTER_FILTERED_OPERATIONS_TOTAL.inc();
                ParseResult::Filtered
            } else {
                ParseResult::Commit(CommitEvent {
                    did: raw.did,
                    operation: commit.operation,
                    collection: commit.collection,
                    rkey: commit.rkey,
                    record: commit.record,
                    cid: commit.cid,
                })
            }
        }
        ("identity", _, identity) => ParseResult::Identity(IdentityEvent {
            did: raw.did,
            handle: identity.and_then(|i| i.handle),
        }),
        _ => ParseResult::Skip,
    };

    Ok(ParsedMessage {
        time_us: raw.time_us,
        result,
    })
}

pub async fn handle_event(
    indexing: &IndexingService,
    result: ParseResult,
) -> Result<Option<IndexOutcome>, MirrorError> {
    match result {
        ParseResult::Commit(event) => indexing.handle_commit_event(event).await.map(Some),
        ParseResult::Identity(event) => {
            indexing.handle_identity_event(&event).await?;
            Ok(None)
        }
        ParseResult::Filtered | ParseResult::Skip => Ok(None),
    }
}

fn log_index_error(e: &MirrorError) {
    if e.is_skippable() {
        tracing::debug!("skipping live event: {e}");
        return;
    }
    metrics::INGESTER_ERRORS_TOTAL
        .with_label_values(&["index"])
        .inc();
    if e.is_fatal() {
        tracing::error!("live event rejected: {e}");
    } else {
        tracing::warn!("failed to index live event: {e}");
    }
}
