use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Failed,
}

/// Data for one more run, recorded when an add arrives for a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rerun {
    pub data: serde_json::Value,
    pub priority: u32,
    pub delay_ms: u64,
}

/// The stored envelope of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    /// Lower runs first.
    pub priority: u32,
    /// Runs started so far, including the current one.
    pub attempts: u32,
    pub created_at_ms: u64,
    pub state: JobState,
    /// Key of this job in the waiting or delayed partition.
    #[serde(with = "serde_bytes")]
    pub index_key: Vec<u8>,
    pub last_error: Option<String>,
    pub rerun: Option<Rerun>,
}

impl Job {
    pub(super) fn new(
        id: String,
        name: String,
        data: serde_json::Value,
        priority: u32,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id,
            name,
            data,
            priority,
            attempts: 0,
            created_at_ms,
            state: JobState::Waiting,
            index_key: Vec::new(),
            last_error: None,
            rerun: None,
        }
    }
}

/// Scheduling options in the job wire contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Idempotency key; doubles as the durable job id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

/// `{ queueName, jobName, data, options: { jobId?, priority?, delay? } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub queue_name: String,
    pub job_name: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
}
