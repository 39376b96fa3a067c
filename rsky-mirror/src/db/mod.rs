//! Storage seam for the index.
//!
//! [`IndexReader`] answers the membership questions the indexing policies ask.
//! [`UnitOfWork`] is an explicit transaction: every write of one record (or one
//! backfill chunk) goes through a single value that is committed or dropped as
//! a whole. [`Database`] hands out units of work and carries the few writes that
//! stand on their own (backfill status, stat recounts).

pub mod memory;
pub mod postgres;

use crate::lexicon::{Collection, Follow, Generator, Like, Post, Profile, Repost, Subscription};
use crate::record::Record;
use crate::types::MirrorError;
use crate::uri::AtUri;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackfillStatus {
    Dirty,
    InProcess,
    Synchronized,
}

impl BackfillStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dirty => "dirty",
            Self::InProcess => "in-process",
            Self::Synchronized => "synchronized",
        }
    }
}

impl fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillStatus {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dirty" => Ok(Self::Dirty),
            "in-process" => Ok(Self::InProcess),
            "synchronized" => Ok(Self::Synchronized),
            other => Err(MirrorError::Other(format!("unknown backfill status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub did: String,
    pub handle: Option<String>,
    pub backfill_status: BackfillStatus,
}

/// Per-post counters kept in `post_agg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStat {
    Like,
    Repost,
    Reply,
}

impl PostStat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Repost => "repost",
            Self::Reply => "reply",
        }
    }
}

/// Per-actor counters kept in `profile_agg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorStat {
    Followers,
    Follows,
    Posts,
}

impl ActorStat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Followers => "followers",
            Self::Follows => "follows",
            Self::Posts => "posts",
        }
    }
}

/// The collection row a delete removed, with the fields needed to recount
/// whatever its creation counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovedRow {
    Post {
        creator: String,
        reply_parent: Option<String>,
    },
    Profile {
        creator: String,
    },
    Follow {
        creator: String,
        subject: String,
    },
    Like {
        creator: String,
        subject: String,
    },
    Repost {
        creator: String,
        subject: String,
    },
    Generator {
        creator: String,
    },
    Subscription {
        creator: String,
    },
}

/// Read-only questions asked of current index state.
///
/// The tracked-actor set is every subscriber plus every account a subscriber
/// follows.
#[async_trait]
pub trait IndexReader: Send + Sync {
    async fn actor(&self, did: &str) -> Result<Option<Actor>, MirrorError>;

    async fn is_subscriber(&self, did: &str) -> Result<bool, MirrorError>;

    async fn is_tracked(&self, did: &str) -> Result<bool, MirrorError>;

    /// Members of `dids` that are in the tracked-actor set.
    async fn tracked_among(&self, dids: &[String]) -> Result<HashSet<String>, MirrorError>;

    /// Whether any account following `did` is itself tracked.
    async fn has_tracked_follower(&self, did: &str) -> Result<bool, MirrorError>;

    async fn is_post_indexed(&self, uri: &str) -> Result<bool, MirrorError>;
}

/// One transaction. Writes become visible to other readers only after
/// [`UnitOfWork::commit`]; dropping an uncommitted unit discards them.
#[async_trait]
pub trait UnitOfWork: IndexReader {
    /// Creates the actor if unseen. A `None` handle never clears a known one.
    async fn upsert_actor(&mut self, did: &str, handle: Option<&str>) -> Result<(), MirrorError>;

    async fn upsert_record(&mut self, record: &Record) -> Result<(), MirrorError>;

    async fn upsert_post(&mut self, record: &Record, post: &Post) -> Result<(), MirrorError>;

    async fn upsert_profile(&mut self, record: &Record, profile: &Profile)
    -> Result<(), MirrorError>;

    async fn upsert_follow(&mut self, record: &Record, follow: &Follow) -> Result<(), MirrorError>;

    async fn upsert_like(&mut self, record: &Record, like: &Like) -> Result<(), MirrorError>;

    async fn upsert_repost(&mut self, record: &Record, repost: &Repost) -> Result<(), MirrorError>;

    async fn upsert_generator(
        &mut self,
        record: &Record,
        generator: &Generator,
    ) -> Result<(), MirrorError>;

    async fn upsert_subscription(
        &mut self,
        record: &Record,
        subscription: &Subscription,
    ) -> Result<(), MirrorError>;

    /// Removes the raw record and its collection row.
    async fn delete_record(
        &mut self,
        uri: &AtUri,
        collection: Collection,
    ) -> Result<Option<RemovedRow>, MirrorError>;

    async fn commit(self: Box<Self>) -> Result<(), MirrorError>;

    async fn rollback(self: Box<Self>) -> Result<(), MirrorError>;
}

#[async_trait]
pub trait Database: IndexReader {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, MirrorError>;

    /// Autocommitted actor upsert, for identity events and handle resolution.
    async fn upsert_actor(&self, did: &str, handle: Option<&str>) -> Result<(), MirrorError>;

    /// Creates the actor if unseen.
    async fn set_backfill_status(
        &self,
        did: &str,
        status: BackfillStatus,
    ) -> Result<(), MirrorError>;

    /// Recounts one post counter from stored rows and returns the new value.
    async fn refresh_post_stat(&self, uri: &str, stat: PostStat) -> Result<i64, MirrorError>;

    /// Recounts one actor counter from stored rows and returns the new value.
    async fn refresh_actor_stat(&self, did: &str, stat: ActorStat) -> Result<i64, MirrorError>;
}
