//! Durable named job queues on fjall.
//!
//! Each queue owns six partitions in one keyspace:
//!
//! - `{name}_jobs`: job id -> CBOR [`Job`]
//! - `{name}_waiting`: priority BE ++ seq BE -> job id
//! - `{name}_delayed`: ready-at millis BE ++ seq BE -> job id
//! - `{name}_active`: job id -> started-at millis BE
//! - `{name}_failed`: job id -> failed-at millis BE
//! - `{name}_logs`: job id ++ 0x00 ++ seq BE -> log line
//!
//! Every state transition is one keyspace batch, so a crash never leaves a
//! job in two states or none.

mod job;

pub use job::{Job, JobOptions, JobRequest, JobState, Rerun};

use crate::config::{FSYNC_MS, QUEUE_CACHE_SIZE};
use crate::metrics;
use crate::types::MirrorError;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use rand::Rng;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Result of [`JobQueue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Enqueued,
    /// A waiting or delayed job with the same id absorbed this add.
    Deduplicated,
    /// The job with this id is running; it will run again with the new data
    /// once the current run completes.
    RerunScheduled,
}

/// Result of [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub failed: usize,
}

/// Folds the data of a duplicate add into the data of the pending job.
pub type MergeFn = fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Without one, the pending job keeps its data on a duplicate add.
    pub merge: Option<MergeFn>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            merge: None,
        }
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

fn now_us() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, MirrorError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| MirrorError::Serialization(format!("failed to serialize job: {e}")))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MirrorError> {
    ciborium::from_reader(bytes)
        .map_err(|e| MirrorError::Serialization(format!("failed to deserialize job: {e}")))
}

fn order_key(high: u64, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&high.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn log_prefix(id: &str) -> Vec<u8> {
    let mut prefix = id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

/// One fjall keyspace holding every queue plus the ingester cursor.
#[derive(Clone)]
pub struct QueueStore {
    keyspace: Keyspace,
    cursors: PartitionHandle,
}

impl QueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MirrorError> {
        let keyspace = Config::new(path)
            .cache_size(*QUEUE_CACHE_SIZE)
            .fsync_ms(FSYNC_MS)
            .open()
            .map_err(|e| MirrorError::Other(format!("failed to open queue store: {e}")))?;
        let cursors = keyspace.open_partition("cursors", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, cursors })
    }

    pub fn queue(&self, name: &str, options: QueueOptions) -> Result<JobQueue, MirrorError> {
        let open = |suffix: &str| {
            self.keyspace
                .open_partition(&format!("{name}_{suffix}"), PartitionCreateOptions::default())
        };
        Ok(JobQueue {
            inner: Arc::new(QueueInner {
                name: name.to_owned(),
                options,
                keyspace: self.keyspace.clone(),
                jobs: open("jobs")?,
                waiting: open("waiting")?,
                delayed: open("delayed")?,
                active: open("active")?,
                failed: open("failed")?,
                logs: open("logs")?,
                seq: AtomicU64::new(now_us()),
                transitions: Mutex::new(()),
                notify: Notify::new(),
            }),
        })
    }

    pub fn get_cursor(&self, name: &str) -> Result<Option<i64>, MirrorError> {
        let Some(value) = self.cursors.get(name.as_bytes())? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = value
            .as_ref()
            .try_into()
            .map_err(|_| MirrorError::Other("invalid cursor format".into()))?;
        Ok(Some(i64::from_be_bytes(bytes)))
    }

    pub fn set_cursor(&self, name: &str, value: i64) -> Result<(), MirrorError> {
        self.cursors.insert(name.as_bytes(), value.to_be_bytes())?;
        Ok(())
    }
}

struct QueueInner {
    name: String,
    options: QueueOptions,
    keyspace: Keyspace,
    jobs: PartitionHandle,
    waiting: PartitionHandle,
    delayed: PartitionHandle,
    active: PartitionHandle,
    failed: PartitionHandle,
    logs: PartitionHandle,
    seq: AtomicU64,
    transitions: Mutex<()>,
    notify: Notify,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn load(&self, id: &str) -> Result<Option<Job>, MirrorError> {
        self.inner
            .jobs
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Places `job` in the waiting or delayed index, setting its state and
    /// index key. The caller commits the batch.
    fn schedule(&self, batch: &mut fjall::Batch, job: &mut Job, delay: Duration) {
        let seq = self.next_seq();
        if delay.is_zero() {
            job.state = JobState::Waiting;
            job.index_key = order_key(u64::from(job.priority), seq);
            batch.insert(&self.inner.waiting, job.index_key.as_slice(), job.id.as_bytes());
        } else {
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            let ready_at = now_ms().saturating_add(delay_ms);
            job.state = JobState::Delayed;
            job.index_key = order_key(ready_at, seq);
            batch.insert(&self.inner.delayed, job.index_key.as_slice(), job.id.as_bytes());
        }
    }

    /// Adds a job. Ids are idempotency keys: a second add with the id of a
    /// pending job collapses into it.
    pub fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        options: &JobOptions,
    ) -> Result<AddOutcome, MirrorError> {
        let priority = options.priority.unwrap_or(0);
        let delay = Duration::from_millis(options.delay.unwrap_or(0));
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| format!("{name}:{}", self.next_seq()));

        let _guard = self.lock();
        let mut batch = self.inner.keyspace.batch();

        if let Some(mut existing) = self.load(&id)? {
            match existing.state {
                JobState::Waiting | JobState::Delayed => {
                    let mut changed = false;
                    if let Some(merge) = self.inner.options.merge {
                        let merged = merge(&existing.data, &data);
                        if merged != existing.data {
                            existing.data = merged;
                            changed = true;
                        }
                    }
                    // a more urgent add lifts the pending job's priority
                    if priority < existing.priority {
                        existing.priority = priority;
                        if existing.state == JobState::Waiting {
                            batch.remove(&self.inner.waiting, existing.index_key.as_slice());
                            self.schedule(&mut batch, &mut existing, Duration::ZERO);
                        }
                        changed = true;
                    }
                    if changed {
                        batch.insert(&self.inner.jobs, id.as_bytes(), encode(&existing)?);
                        batch.commit()?;
                    }
                    metrics::QUEUE_JOBS_DEDUPLICATED_TOTAL
                        .with_label_values(&[self.name()])
                        .inc();
                    return Ok(AddOutcome::Deduplicated);
                }
                JobState::Active => {
                    let rerun = match (existing.rerun.take(), self.inner.options.merge) {
                        (Some(prev), Some(merge)) => Rerun {
                            data: merge(&prev.data, &data),
                            priority: priority.min(prev.priority),
                            delay_ms: options.delay.unwrap_or(0),
                        },
                        (Some(prev), None) => Rerun {
                            data,
                            priority: priority.min(prev.priority),
                            delay_ms: options.delay.unwrap_or(0),
                        },
                        (None, _) => Rerun {
                            data,
                            priority,
                            delay_ms: options.delay.unwrap_or(0),
                        },
                    };
                    existing.rerun = Some(rerun);
                    batch.insert(&self.inner.jobs, id.as_bytes(), encode(&existing)?);
                    batch.commit()?;
                    metrics::QUEUE_JOBS_DEDUPLICATED_TOTAL
                        .with_label_values(&[self.name()])
                        .inc();
                    return Ok(AddOutcome::RerunScheduled);
                }
                JobState::Failed => {
                    batch.remove(&self.inner.failed, id.as_bytes());
                }
            }
        }

        self.clear_logs(&mut batch, &id)?;
        let mut job = Job::new(id, name.to_owned(), data, priority, now_ms());
        self.schedule(&mut batch, &mut job, delay);
        batch.insert(&self.inner.jobs, job.id.as_bytes(), encode(&job)?);
        batch.commit()?;

        metrics::QUEUE_JOBS_ENQUEUED_TOTAL
            .with_label_values(&[self.name()])
            .inc();
        self.inner.notify.notify_one();
        Ok(AddOutcome::Enqueued)
    }

    fn clear_logs(&self, batch: &mut fjall::Batch, id: &str) -> Result<(), MirrorError> {
        for entry in self.inner.logs.prefix(log_prefix(id)) {
            let (key, _) = entry?;
            batch.remove(&self.inner.logs, key);
        }
        Ok(())
    }

    /// Moves delayed jobs whose time has come into the waiting index.
    fn promote_delayed(&self, batch: &mut fjall::Batch) -> Result<usize, MirrorError> {
        let now = now_ms().to_be_bytes();
        let mut promoted = 0;
        for entry in self.inner.delayed.iter() {
            let (key, id) = entry?;
            if key.len() < 8 || key[..8] > now[..] {
                break;
            }
            batch.remove(&self.inner.delayed, key);
            let id = String::from_utf8_lossy(&id).into_owned();
            let Some(mut job) = self.load(&id)? else {
                continue;
            };
            self.schedule(batch, &mut job, Duration::ZERO);
            batch.insert(&self.inner.jobs, job.id.as_bytes(), encode(&job)?);
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Takes the most urgent ready job and marks it active.
    pub fn next_ready(&self) -> Result<Option<Job>, MirrorError> {
        let _guard = self.lock();

        let mut batch = self.inner.keyspace.batch();
        if self.promote_delayed(&mut batch)? > 0 {
            batch.commit()?;
            batch = self.inner.keyspace.batch();
        }

        for entry in self.inner.waiting.iter() {
            let (key, id) = entry?;
            let id = String::from_utf8_lossy(&id).into_owned();
            let Some(mut job) = self.load(&id)? else {
                tracing::warn!("queue {} dropping dangling index entry for {id}", self.name());
                self.inner.waiting.remove(key)?;
                continue;
            };
            batch.remove(&self.inner.waiting, key);
            job.state = JobState::Active;
            job.attempts += 1;
            job.index_key.clear();
            batch.insert(&self.inner.active, id.as_bytes(), &now_ms().to_be_bytes()[..]);
            batch.insert(&self.inner.jobs, id.as_bytes(), encode(&job)?);
            batch.commit()?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Finishes an active job. A rerun recorded while it ran is enqueued now.
    pub fn complete(&self, job: &Job) -> Result<(), MirrorError> {
        let _guard = self.lock();
        let mut batch = self.inner.keyspace.batch();
        batch.remove(&self.inner.active, job.id.as_bytes());

        let rerun = self.load(&job.id)?.and_then(|current| current.rerun);
        if let Some(rerun) = rerun {
            let mut next = Job::new(
                job.id.clone(),
                job.name.clone(),
                rerun.data,
                rerun.priority,
                now_ms(),
            );
            self.schedule(&mut batch, &mut next, Duration::from_millis(rerun.delay_ms));
            batch.insert(&self.inner.jobs, next.id.as_bytes(), encode(&next)?);
            batch.commit()?;
            self.inner.notify.notify_one();
        } else {
            batch.remove(&self.inner.jobs, job.id.as_bytes());
            batch.commit()?;
        }

        metrics::QUEUE_JOBS_COMPLETED_TOTAL
            .with_label_values(&[self.name()])
            .inc();
        Ok(())
    }

    /// Records a failed run. Retries with exponential backoff and jitter until
    /// the attempt budget is spent, then moves the job to the failed partition.
    pub fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome, MirrorError> {
        let _guard = self.lock();
        let mut current = self.load(&job.id)?.unwrap_or_else(|| job.clone());
        let mut batch = self.inner.keyspace.batch();
        batch.remove(&self.inner.active, job.id.as_bytes());
        current.last_error = Some(error.to_owned());

        if let Some(rerun) = current.rerun.take() {
            // newer data arrived while this run failed; start over with it
            current.data = rerun.data;
            current.priority = rerun.priority;
            current.attempts = 0;
            self.schedule(&mut batch, &mut current, Duration::from_millis(rerun.delay_ms));
            batch.insert(&self.inner.jobs, current.id.as_bytes(), encode(&current)?);
            batch.commit()?;
            return Ok(FailOutcome::Retrying {
                delay: Duration::from_millis(rerun.delay_ms),
            });
        }

        if current.attempts >= self.inner.options.max_attempts {
            current.state = JobState::Failed;
            current.index_key.clear();
            batch.insert(&self.inner.failed, current.id.as_bytes(), &now_ms().to_be_bytes()[..]);
            batch.insert(&self.inner.jobs, current.id.as_bytes(), encode(&current)?);
            batch.commit()?;
            metrics::QUEUE_JOBS_DEAD_LETTERED_TOTAL
                .with_label_values(&[self.name()])
                .inc();
            return Ok(FailOutcome::DeadLettered);
        }

        let delay = self.backoff(current.attempts);
        self.schedule(&mut batch, &mut current, delay);
        batch.insert(&self.inner.jobs, current.id.as_bytes(), encode(&current)?);
        batch.commit()?;
        metrics::QUEUE_JOBS_RETRIED_TOTAL
            .with_label_values(&[self.name()])
            .inc();
        Ok(FailOutcome::Retrying { delay })
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let base = self.inner.options.backoff_base;
        let exp = base.saturating_mul(1u32 << attempts.saturating_sub(1).min(16));
        let jitter_ms = u64::try_from(base.as_millis() / 2).unwrap_or(0);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }

    /// Returns jobs left active by a previous process to the waiting index.
    pub fn recover_stalled(&self) -> Result<usize, MirrorError> {
        let _guard = self.lock();
        let mut batch = self.inner.keyspace.batch();
        let mut recovered = 0;
        for entry in self.inner.active.iter() {
            let (id, _) = entry?;
            batch.remove(&self.inner.active, id.clone());
            let id = String::from_utf8_lossy(&id).into_owned();
            let Some(mut job) = self.load(&id)? else {
                continue;
            };
            self.schedule(&mut batch, &mut job, Duration::ZERO);
            batch.insert(&self.inner.jobs, job.id.as_bytes(), encode(&job)?);
            recovered += 1;
        }
        batch.commit()?;
        if recovered > 0 {
            tracing::info!("queue {} recovered {recovered} stalled jobs", self.name());
            self.inner.notify.notify_waiters();
        }
        Ok(recovered)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, MirrorError> {
        self.load(id)
    }

    /// Appends a line to the job's log.
    pub fn log(&self, id: &str, line: &str) -> Result<(), MirrorError> {
        let mut key = log_prefix(id);
        key.extend_from_slice(&self.next_seq().to_be_bytes());
        self.inner.logs.insert(key, line.as_bytes())?;
        tracing::info!(queue = %self.name(), job = %id, "{line}");
        Ok(())
    }

    pub fn logs(&self, id: &str) -> Result<Vec<String>, MirrorError> {
        self.inner
            .logs
            .prefix(log_prefix(id))
            .map(|entry| {
                let (_, line) = entry?;
                Ok(String::from_utf8_lossy(&line).into_owned())
            })
            .collect()
    }

    /// Waiting jobs in run order, then delayed jobs in due order.
    pub fn pending(&self) -> Result<Vec<Job>, MirrorError> {
        let mut jobs = Vec::new();
        for partition in [&self.inner.waiting, &self.inner.delayed] {
            for entry in partition.iter() {
                let (_, id) = entry?;
                if let Some(job) = self.load(&String::from_utf8_lossy(&id))? {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    pub fn failed(&self) -> Result<Vec<Job>, MirrorError> {
        let mut jobs = Vec::new();
        for entry in self.inner.failed.iter() {
            let (id, _) = entry?;
            if let Some(job) = self.load(&String::from_utf8_lossy(&id))? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub fn counts(&self) -> Result<QueueCounts, MirrorError> {
        let counts = QueueCounts {
            waiting: self.inner.waiting.len()?,
            delayed: self.inner.delayed.len()?,
            active: self.inner.active.len()?,
            failed: self.inner.failed.len()?,
        };
        metrics::QUEUE_JOBS_WAITING
            .with_label_values(&[self.name()])
            .set(i64::try_from(counts.waiting + counts.delayed).unwrap_or(i64::MAX));
        metrics::QUEUE_JOBS_ACTIVE
            .with_label_values(&[self.name()])
            .set(i64::try_from(counts.active).unwrap_or(i64::MAX));
        Ok(counts)
    }

    /// Resolves when a job is added, or after `timeout` so delayed jobs get
    /// promoted.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.inner.notify.notified()).await;
    }
}

/// Handle given to a job handler: the job plus its log.
#[derive(Clone)]
pub struct JobContext {
    queue: JobQueue,
    job: Job,
}

impl JobContext {
    #[must_use]
    pub const fn new(queue: JobQueue, job: Job) -> Self {
        Self { queue, job }
    }

    #[must_use]
    pub const fn job(&self) -> &Job {
        &self.job
    }

    pub fn data<T: DeserializeOwned>(&self) -> Result<T, MirrorError> {
        serde_json::from_value(self.job.data.clone())
            .map_err(|e| MirrorError::Serialization(format!("bad {} payload: {e}", self.job.name)))
    }

    /// Writes to the job log. A storage error here is reported, never raised,
    /// so a full disk cannot fail an otherwise successful job.
    pub fn log(&self, line: impl AsRef<str>) {
        if let Err(e) = self.queue.log(&self.job.id, line.as_ref()) {
            tracing::warn!("failed to write job log for {}: {e}", self.job.id);
        }
    }
}
