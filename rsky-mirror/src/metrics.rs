use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder, register_int_counter,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
};
use std::sync::LazyLock;

// =============================================================================
// IDENTITY METRICS
// =============================================================================

pub static IDENTITY_RESOLUTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "identity_resolutions_total",
        "Total number of remote DID resolutions",
        &["method"]
    )
    .unwrap()
});

pub static IDENTITY_RESOLUTION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "identity_resolution_errors_total",
        "Total number of failed DID resolutions"
    )
    .unwrap()
});

pub static IDENTITY_CACHE_HITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("identity_cache_hits_total", "Total number of DID cache hits").unwrap()
});

pub static IDENTITY_CACHE_MISSES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "identity_cache_misses_total",
        "Total number of DID cache misses"
    )
    .unwrap()
});

pub static IDENTITY_CACHE_STALE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "identity_cache_stale_total",
        "Total number of DID cache hits served stale while refreshing"
    )
    .unwrap()
});

// =============================================================================
// FETCHER METRICS
// =============================================================================

pub static FETCHER_RECORDS_FETCHED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "fetcher_records_fetched_total",
        "Total number of single records fetched from their PDS"
    )
    .unwrap()
});

pub static FETCHER_RECORD_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "fetcher_record_errors_total",
        "Total number of single record fetch failures",
        &["type"]
    )
    .unwrap()
});

pub static FETCHER_REPOS_FETCHED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "fetcher_repos_fetched_total",
        "Total number of repositories downloaded and verified"
    )
    .unwrap()
});

pub static FETCHER_REPO_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "fetcher_repo_errors_total",
        "Total number of repository download failures"
    )
    .unwrap()
});

pub static FETCHER_VERIFICATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "fetcher_verification_errors_total",
        "Total number of repositories that failed verification"
    )
    .unwrap()
});

pub static FETCHER_DEPTH_SKIPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "fetcher_depth_skipped_total",
        "Total number of record fetches dropped at the depth limit"
    )
    .unwrap()
});

pub static FETCHER_UNSUPPORTED_SKIPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "fetcher_unsupported_skipped_total",
        "Total number of record fetches dropped for an unsupported collection"
    )
    .unwrap()
});

// =============================================================================
// INDEXER METRICS
// =============================================================================

pub static INDEXER_RECORDS_INDEXED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_records_indexed_total",
        "Total number of records written to the index",
        &["collection"]
    )
    .unwrap()
});

pub static INDEXER_RECORDS_SKIPPED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_records_skipped_total",
        "Total number of records not written to the index",
        &["reason"]
    )
    .unwrap()
});

pub static INDEXER_RECORDS_DELETED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "indexer_records_deleted_total",
        "Total number of records removed from the index"
    )
    .unwrap()
});

pub static INDEXER_RECORDS_FAILED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "indexer_records_failed_total",
        "Total number of records that failed to index"
    )
    .unwrap()
});

// =============================================================================
// BACKFILL METRICS
// =============================================================================

pub static BACKFILL_REPOS_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "backfill_repos_running",
        "Number of repositories currently being imported"
    )
    .unwrap()
});

pub static BACKFILL_REPOS_COMPLETED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_repos_completed_total",
        "Total number of repositories fully imported"
    )
    .unwrap()
});

pub static BACKFILL_REPOS_FAILED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_repos_failed_total",
        "Total number of repository imports that failed"
    )
    .unwrap()
});

pub static BACKFILL_CHUNKS_COMMITTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_chunks_committed_total",
        "Total number of backfill chunk transactions committed"
    )
    .unwrap()
});

pub static BACKFILL_RECORDS_IMPORTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_records_imported_total",
        "Total number of records imported by backfill"
    )
    .unwrap()
});

// =============================================================================
// QUEUE METRICS
// =============================================================================

pub static QUEUE_JOBS_ENQUEUED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_jobs_enqueued_total",
        "Total number of jobs added",
        &["queue"]
    )
    .unwrap()
});

pub static QUEUE_JOBS_DEDUPLICATED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_jobs_deduplicated_total",
        "Total number of adds collapsed into an existing job",
        &["queue"]
    )
    .unwrap()
});

pub static QUEUE_JOBS_COMPLETED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_jobs_completed_total",
        "Total number of jobs completed",
        &["queue"]
    )
    .unwrap()
});

pub static QUEUE_JOBS_RETRIED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_jobs_retried_total",
        "Total number of failed jobs scheduled for retry",
        &["queue"]
    )
    .unwrap()
});

pub static QUEUE_JOBS_DEAD_LETTERED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_jobs_dead_lettered_total",
        "Total number of jobs moved to the failed partition",
        &["queue"]
    )
    .unwrap()
});

pub static QUEUE_JOBS_WAITING: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "queue_jobs_waiting",
        "Number of jobs waiting or delayed",
        &["queue"]
    )
    .unwrap()
});

pub static QUEUE_JOBS_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "queue_jobs_active",
        "Number of jobs currently running",
        &["queue"]
    )
    .unwrap()
});

// =============================================================================
// INGESTER METRICS
// =============================================================================

pub static INGESTER_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ingester_events_total",
        "Total number of jetstream events received",
        &["kind"]
    )
    .unwrap()
});

pub static INGESTER_FILTERED_OPERATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "ingester_filtered_operations_total",
        "Total number of commit operations dropped for unsupported collections"
    )
    .unwrap()
});

pub static INGESTER_WEBSOCKET_CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "ingester_websocket_connections",
        "Number of active jetstream connections"
    )
    .unwrap()
});

pub static INGESTER_RETRIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "ingester_retries_total",
        "Total number of live events retried after a retryable failure"
    )
    .unwrap()
});

pub static INGESTER_DROPPED_EVENTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "ingester_dropped_events_total",
        "Total number of live events given up on after exhausting retries"
    )
    .unwrap()
});

pub static INGESTER_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ingester_errors_total",
        "Total number of ingester errors",
        &["type"]
    )
    .unwrap()
});

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("failed to convert metrics to UTF-8: {e}")))
}

/// Initialize metrics that need starting values
pub fn initialize_metrics() {
    BACKFILL_REPOS_RUNNING.set(0);
    INGESTER_WEBSOCKET_CONNECTIONS.set(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_registered_metrics() {
        initialize_metrics();
        FETCHER_DEPTH_SKIPPED_TOTAL.inc();
        INDEXER_RECORDS_INDEXED_TOTAL
            .with_label_values(&["app.bsky.feed.post"])
            .inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("fetcher_depth_skipped_total"));
        assert!(text.contains("indexer_records_indexed_total"));
        assert!(text.contains("backfill_repos_running"));
    }
}
