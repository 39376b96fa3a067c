use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    DidResolution(#[from] DidResolutionError),
    #[error(transparent)]
    RecordFetch(#[from] RecordFetchError),
    #[error(transparent)]
    Validation(#[from] RecordValidationError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("unsupported collection: {0}")]
    UnsupportedCollection(String),
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("repo error: {0}")]
    Repo(String),
    #[error("other: {0}")]
    Other(String),
}

impl MirrorError {
    /// Errors that abandon the item at hand without failing the job.
    /// Malformed data never improves on retry.
    #[must_use]
    pub const fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::RecordFetch(_) | Self::Validation(_) | Self::InvalidUri(_)
        )
    }

    /// Errors that indicate a deployment mismatch rather than bad data.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedCollection(_))
    }
}

/// Underlying cause of a failed DID resolution.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("did not found")]
    DidNotFound,
    #[error("poorly formatted did")]
    PoorlyFormattedDid,
    #[error("unsupported did method")]
    UnsupportedDidMethod,
    #[error("poorly formatted did document: {0}")]
    PoorlyFormattedDidDocument(String),
    #[error("transport: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
#[error("failed to resolve {did}: {source}")]
pub struct DidResolutionError {
    pub did: String,
    #[source]
    pub source: IdentityError,
}

impl DidResolutionError {
    pub fn new(did: impl Into<String>, source: IdentityError) -> Self {
        Self {
            did: did.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordFetchError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record host unreachable for {uri}: {reason}")]
    Unreachable { uri: String, reason: String },
    #[error("fetched record {uri} is invalid: {source}")]
    Invalid {
        uri: String,
        #[source]
        source: RecordValidationError,
    },
}

#[derive(Debug, Error)]
#[error("invalid {collection} record: {reason}")]
pub struct RecordValidationError {
    pub collection: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("repo did mismatch: expected {expected}, got {got}")]
    DidMismatch { expected: String, got: String },
    #[error("commit signature does not match signing key")]
    BadSignature,
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("unsupported signing key type: {0}")]
    UnsupportedKey(String),
    #[error("block {0} does not match its cid")]
    BlockHashMismatch(String),
    #[error("missing block {0}")]
    MissingBlock(String),
    #[error("malformed commit: {0}")]
    MalformedCommit(String),
    #[error("unsupported repo version {0}")]
    UnsupportedVersion(u8),
    #[error("mst exceeds bounds: {0}")]
    MstBounds(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

impl WriteAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Identity change for one account, as delivered by the ingestion feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEvent {
    pub did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// One repository mutation, as delivered by the ingestion feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub did: String,
    pub operation: WriteAction,
    pub collection: String,
    pub rkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}
