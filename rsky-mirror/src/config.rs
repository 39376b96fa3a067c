use std::sync::LazyLock;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// Fjall storage config for the job queues
pub static QUEUE_CACHE_SIZE: LazyLock<u64> = LazyLock::new(|| {
    std::env::var("QUEUE_CACHE_SIZE_MB")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map_or(256 * 1024 * 1024, |mb| mb * 1024 * 1024) // Default: 256MB
});

pub const FSYNC_MS: Option<u16> = Some(500);

// Fetch recursion: a fetch at this depth is dropped instead of executed
pub const MAX_FETCH_DEPTH: u32 = 2;

// Queue priorities, lower runs first
pub const PRIORITY_LIVE: u32 = 1;
pub const PRIORITY_BACKGROUND: u32 = 10;

pub const JETSTREAM_PING_INTERVAL: Duration = Duration::from_secs(30);

pub static CURSOR_SAVE_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_or("CURSOR_SAVE_INTERVAL_SECS", 5)));

// Live events are split by repo over this many ordered workers
pub static INGESTER_SHARDS: LazyLock<usize> =
    LazyLock::new(|| env_or::<usize>("INGESTER_SHARDS", 32).max(1));

// Events buffered per shard before the socket read waits
pub static INGESTER_SHARD_BUFFER: LazyLock<usize> =
    LazyLock::new(|| env_or::<usize>("INGESTER_SHARD_BUFFER", 256).max(1));

// Tries per live event on retryable failures
pub static INGESTER_RETRY_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_or::<u32>("INGESTER_RETRY_ATTEMPTS", 5).max(1));

pub static INGESTER_RETRY_BASE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_or("INGESTER_RETRY_BASE_MS", 250)));

// Records per backfill transaction
pub static BACKFILL_CHUNK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_or::<usize>("BACKFILL_CHUNK_SIZE", 500).max(1));

// Per-queue worker concurrency
pub static FETCH_RECORD_CONCURRENCY: LazyLock<usize> =
    LazyLock::new(|| env_or("FETCH_RECORD_CONCURRENCY", 16));
pub static RESOLVE_DID_CONCURRENCY: LazyLock<usize> =
    LazyLock::new(|| env_or("RESOLVE_DID_CONCURRENCY", 16));
pub static BACKFILL_CONCURRENCY: LazyLock<usize> =
    LazyLock::new(|| env_or("BACKFILL_CONCURRENCY", 4));
pub static AGGREGATE_STATS_CONCURRENCY: LazyLock<usize> =
    LazyLock::new(|| env_or("AGGREGATE_STATS_CONCURRENCY", 8));

// Retry policy shared by all queues
pub static JOB_MAX_ATTEMPTS: LazyLock<u32> = LazyLock::new(|| env_or("JOB_MAX_ATTEMPTS", 5));
pub static JOB_BACKOFF_BASE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_or("JOB_BACKOFF_BASE_MS", 2_000)));

// Stat jobs for the same subject collapse into one run within this window
pub static STATS_DEBOUNCE_DELAY: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_or("STATS_DEBOUNCE_DELAY_MS", 30_000)));

// DID cache horizons
pub static DID_CACHE_STALE_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_or("DID_CACHE_STALE_TTL_SECS", 60 * 60)));
pub static DID_CACHE_MAX_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_or("DID_CACHE_MAX_TTL_SECS", 24 * 60 * 60)));

pub static TRACKED_CACHE_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_or("TRACKED_CACHE_TTL_SECS", 60)));

// Remote call timeouts
pub const IDENTITY_RESOLVER_TIMEOUT: Duration = Duration::from_secs(3);
pub static RECORD_FETCH_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_or("RECORD_FETCH_TIMEOUT_SECS", 10)));
pub static REPO_FETCH_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_or("REPO_FETCH_TIMEOUT_SECS", 120)));

// getRepo bodies larger than this are refused before parsing
pub static MAX_REPO_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_or::<usize>("MAX_REPO_MB", 512).saturating_mul(1024 * 1024));

// Bounds on the MST walk of a downloaded repository
pub const MAX_MST_DEPTH: usize = 128;
pub static MAX_MST_NODES: LazyLock<usize> =
    LazyLock::new(|| env_or("MAX_MST_NODES", 4_000_000));

pub static DB_POOL_SIZE: LazyLock<usize> = LazyLock::new(|| env_or("DB_POOL_SIZE", 20));

pub const DEFAULT_PLC_URL: &str = "https://plc.directory";

/// What happens to an actor's backfill status when its repository fails to
/// download or verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailurePolicy {
    /// Stay `in-process` until a queue retry succeeds or the job dead-letters.
    LeaveInProcess,
    /// Go straight back to `dirty`.
    RevertToDirty,
}

impl std::str::FromStr for VerificationFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leave" | "in-process" => Ok(Self::LeaveInProcess),
            "revert" | "dirty" => Ok(Self::RevertToDirty),
            other => Err(format!("unknown verification failure policy: {other}")),
        }
    }
}

pub static BACKFILL_VERIFICATION_FAILURE: LazyLock<VerificationFailurePolicy> =
    LazyLock::new(|| {
        std::env::var("BACKFILL_VERIFICATION_FAILURE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(VerificationFailurePolicy::LeaveInProcess)
    });

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_policy_parse() {
        assert_eq!(
            "revert".parse::<VerificationFailurePolicy>().unwrap(),
            VerificationFailurePolicy::RevertToDirty
        );
        assert_eq!(
            "LEAVE".parse::<VerificationFailurePolicy>().unwrap(),
            VerificationFailurePolicy::LeaveInProcess
        );
        assert!("sometimes".parse::<VerificationFailurePolicy>().is_err());
    }

    #[test]
    fn test_priorities_order_live_first() {
        assert!(PRIORITY_LIVE < PRIORITY_BACKGROUND);
        assert_eq!(MAX_FETCH_DEPTH, 2);
    }
}
