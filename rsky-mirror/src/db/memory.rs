//! In-process [`Database`] used by tests and local runs without Postgres.
//!
//! A unit of work reads from a private copy of the state and records its
//! writes as operations; commit replays them onto the shared state under one
//! lock, so a dropped unit leaves nothing behind.

use super::{
    Actor, ActorStat, BackfillStatus, Database, IndexReader, PostStat, RemovedRow, UnitOfWork,
};
use crate::lexicon::{
    Collection, Follow, Generator, Like, Post, Profile, Repost, Subscription, TypedRecord,
};
use crate::record::Record;
use crate::types::MirrorError;
use crate::uri::AtUri;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub cid: String,
    pub did: String,
    pub json: serde_json::Value,
    pub indexed_at: DateTime<Utc>,
}

/// A collection row: the typed record plus who wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct Row<T> {
    pub cid: String,
    pub creator: String,
    pub value: T,
    pub sort_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostAgg {
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileAgg {
    pub followers_count: i64,
    pub follows_count: i64,
    pub posts_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub actors: BTreeMap<String, Actor>,
    pub records: BTreeMap<String, StoredRecord>,
    pub posts: BTreeMap<String, Row<Post>>,
    pub profiles: BTreeMap<String, Row<Profile>>,
    pub follows: BTreeMap<String, Row<Follow>>,
    pub likes: BTreeMap<String, Row<Like>>,
    pub reposts: BTreeMap<String, Row<Repost>>,
    pub generators: BTreeMap<String, Row<Generator>>,
    pub subscriptions: BTreeMap<String, Row<Subscription>>,
    pub post_agg: BTreeMap<String, PostAgg>,
    pub profile_agg: BTreeMap<String, ProfileAgg>,
}

#[derive(Debug, Clone)]
enum Op {
    Actor { did: String, handle: Option<String> },
    Record(Record),
    Collection(Record),
    Delete(AtUri, Collection),
}

fn row<T: Clone>(record: &Record, value: &T) -> Row<T> {
    Row {
        cid: record.cid().to_owned(),
        creator: record.author().to_owned(),
        value: value.clone(),
        sort_at: record.sort_at(),
    }
}

impl MemoryState {
    fn upsert_actor(&mut self, did: &str, handle: Option<&str>) {
        let actor = self.actors.entry(did.to_owned()).or_insert_with(|| Actor {
            did: did.to_owned(),
            handle: None,
            backfill_status: BackfillStatus::Dirty,
        });
        if let Some(handle) = handle {
            actor.handle = Some(handle.to_owned());
        }
    }

    fn apply(&mut self, op: &Op) -> Option<RemovedRow> {
        match op {
            Op::Actor { did, handle } => {
                self.upsert_actor(did, handle.as_deref());
                None
            }
            Op::Record(record) => {
                self.records.insert(
                    record.uri().to_string(),
                    StoredRecord {
                        cid: record.cid().to_owned(),
                        did: record.author().to_owned(),
                        json: record.json().clone(),
                        indexed_at: record.indexed_at(),
                    },
                );
                None
            }
            Op::Collection(record) => {
                let uri = record.uri().to_string();
                match record.value() {
                    TypedRecord::Post(v) => {
                        self.posts.insert(uri, row(record, v));
                    }
                    TypedRecord::Profile(v) => {
                        self.profiles.insert(uri, row(record, v));
                    }
                    TypedRecord::Follow(v) => {
                        self.follows.insert(uri, row(record, v));
                    }
                    TypedRecord::Like(v) => {
                        self.likes.insert(uri, row(record, v));
                    }
                    TypedRecord::Repost(v) => {
                        self.reposts.insert(uri, row(record, v));
                    }
                    TypedRecord::Generator(v) => {
                        self.generators.insert(uri, row(record, v));
                    }
                    TypedRecord::Subscription(v) => {
                        self.subscriptions.insert(uri, row(record, v));
                    }
                }
                None
            }
            Op::Delete(uri, collection) => {
                let key = uri.to_string();
                self.records.remove(&key);
                match collection {
                    Collection::Post => self.posts.remove(&key).map(|r| RemovedRow::Post {
                        reply_parent: r.value.reply.map(|reply| reply.parent.uri),
                        creator: r.creator,
                    }),
                    Collection::Profile => self
                        .profiles
                        .remove(&key)
                        .map(|r| RemovedRow::Profile { creator: r.creator }),
                    Collection::Follow => self.follows.remove(&key).map(|r| RemovedRow::Follow {
                        creator: r.creator,
                        subject: r.value.subject,
                    }),
                    Collection::Like => self.likes.remove(&key).map(|r| RemovedRow::Like {
                        creator: r.creator,
                        subject: r.value.subject.uri,
                    }),
                    Collection::Repost => self.reposts.remove(&key).map(|r| RemovedRow::Repost {
                        creator: r.creator,
                        subject: r.value.subject.uri,
                    }),
                    Collection::Generator => self
                        .generators
                        .remove(&key)
                        .map(|r| RemovedRow::Generator { creator: r.creator }),
                    Collection::Subscription => self
                        .subscriptions
                        .remove(&key)
                        .map(|r| RemovedRow::Subscription { creator: r.creator }),
                }
            }
        }
    }

    fn is_subscriber(&self, did: &str) -> bool {
        self.subscriptions.values().any(|s| s.creator == did)
    }

    fn is_tracked(&self, did: &str) -> bool {
        self.is_subscriber(did)
            || self
                .follows
                .values()
                .any(|f| f.value.subject == did && self.is_subscriber(&f.creator))
    }

    fn has_tracked_follower(&self, did: &str) -> bool {
        self.follows
            .values()
            .any(|f| f.value.subject == did && self.is_tracked(&f.creator))
    }

    fn is_post_indexed(&self, uri: &str) -> bool {
        self.posts.contains_key(uri)
    }

    fn count_post_stat(&self, uri: &str, stat: PostStat) -> i64 {
        let n = match stat {
            PostStat::Like => self
                .likes
                .values()
                .filter(|l| l.value.subject.uri == uri)
                .count(),
            PostStat::Repost => self
                .reposts
                .values()
                .filter(|r| r.value.subject.uri == uri)
                .count(),
            PostStat::Reply => self
                .posts
                .values()
                .filter(|p| p.value.reply.as_ref().is_some_and(|r| r.parent.uri == uri))
                .count(),
        };
        i64::try_from(n).unwrap_or(i64::MAX)
    }

    fn count_actor_stat(&self, did: &str, stat: ActorStat) -> i64 {
        let n = match stat {
            ActorStat::Followers => self
                .follows
                .values()
                .filter(|f| f.value.subject == did)
                .count(),
            ActorStat::Follows => self.follows.values().filter(|f| f.creator == did).count(),
            ActorStat::Posts => self.posts.values().filter(|p| p.creator == did).count(),
        };
        i64::try_from(n).unwrap_or(i64::MAX)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state.
    #[must_use]
    pub fn state(&self) -> MemoryState {
        lock(&self.state).clone()
    }

    /// Makes every later write to `table` fail inside its unit of work.
    pub fn fail_writes_to(&self, table: &str) {
        lock(&self.failing).insert(table.to_owned());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    #[must_use]
    pub fn backfill_status(&self, did: &str) -> Option<BackfillStatus> {
        lock(&self.state).actors.get(did).map(|a| a.backfill_status)
    }
}

#[async_trait]
impl IndexReader for MemoryDatabase {
    async fn actor(&self, did: &str) -> Result<Option<Actor>, MirrorError> {
        Ok(lock(&self.state).actors.get(did).cloned())
    }

    async fn is_subscriber(&self, did: &str) -> Result<bool, MirrorError> {
        Ok(lock(&self.state).is_subscriber(did))
    }

    async fn is_tracked(&self, did: &str) -> Result<bool, MirrorError> {
        Ok(lock(&self.state).is_tracked(did))
    }

    async fn tracked_among(&self, dids: &[String]) -> Result<HashSet<String>, MirrorError> {
        let state = lock(&self.state);
        Ok(dids
            .iter()
            .filter(|did| state.is_tracked(did))
            .cloned()
            .collect())
    }

    async fn has_tracked_follower(&self, did: &str) -> Result<bool, MirrorError> {
        Ok(lock(&self.state).has_tracked_follower(did))
    }

    async fn is_post_indexed(&self, uri: &str) -> Result<bool, MirrorError> {
        Ok(lock(&self.state).is_post_indexed(uri))
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, MirrorError> {
        Ok(Box::new(MemoryUnitOfWork {
            view: self.state(),
            ops: Vec::new(),
            shared: Arc::clone(&self.state),
            failing: lock(&self.failing).clone(),
        }))
    }

    async fn upsert_actor(&self, did: &str, handle: Option<&str>) -> Result<(), MirrorError> {
        lock(&self.state).upsert_actor(did, handle);
        Ok(())
    }

    async fn set_backfill_status(
        &self,
        did: &str,
        status: BackfillStatus,
    ) -> Result<(), MirrorError> {
        let mut state = lock(&self.state);
        state.upsert_actor(did, None);
        if let Some(actor) = state.actors.get_mut(did) {
            actor.backfill_status = status;
        }
        Ok(())
    }

    async fn refresh_post_stat(&self, uri: &str, stat: PostStat) -> Result<i64, MirrorError> {
        let mut state = lock(&self.state);
        let count = state.count_post_stat(uri, stat);
        let agg = state.post_agg.entry(uri.to_owned()).or_default();
        match stat {
            PostStat::Like => agg.like_count = count,
            PostStat::Repost => agg.repost_count = count,
            PostStat::Reply => agg.reply_count = count,
        }
        Ok(count)
    }

    async fn refresh_actor_stat(&self, did: &str, stat: ActorStat) -> Result<i64, MirrorError> {
        let mut state = lock(&self.state);
        let count = state.count_actor_stat(did, stat);
        let agg = state.profile_agg.entry(did.to_owned()).or_default();
        match stat {
            ActorStat::Followers => agg.followers_count = count,
            ActorStat::Follows => agg.follows_count = count,
            ActorStat::Posts => agg.posts_count = count,
        }
        Ok(count)
    }
}

pub struct MemoryUnitOfWork {
    view: MemoryState,
    ops: Vec<Op>,
    shared: Arc<Mutex<MemoryState>>,
    failing: HashSet<String>,
}

impl MemoryUnitOfWork {
    fn write(&mut self, table: &str, op: Op) -> Result<Option<RemovedRow>, MirrorError> {
        if self.failing.contains(table) {
            return Err(MirrorError::Other(format!("injected write failure on {table}")));
        }
        let removed = self.view.apply(&op);
        self.ops.push(op);
        Ok(removed)
    }
}

const fn table_of(collection: Collection) -> &'static str {
    match collection {
        Collection::Post => "post",
        Collection::Profile => "profile",
        Collection::Follow => "follow",
        Collection::Like => "like",
        Collection::Repost => "repost",
        Collection::Generator => "feed_generator",
        Collection::Subscription => "subscription",
    }
}

#[async_trait]
impl IndexReader for MemoryUnitOfWork {
    async fn actor(&self, did: &str) -> Result<Option<Actor>, MirrorError> {
        Ok(self.view.actors.get(did).cloned())
    }

    async fn is_subscriber(&self, did: &str) -> Result<bool, MirrorError> {
        Ok(self.view.is_subscriber(did))
    }

    async fn is_tracked(&self, did: &str) -> Result<bool, MirrorError> {
        Ok(self.view.is_tracked(did))
    }

    async fn tracked_among(&self, dids: &[String]) -> Result<HashSet<String>, MirrorError> {
        Ok(dids
            .iter()
            .filter(|did| self.view.is_tracked(did))
            .cloned()
            .collect())
    }

    async fn has_tracked_follower(&self, did: &str) -> Result<bool, MirrorError> {
        Ok(self.view.has_tracked_follower(did))
    }

    async fn is_post_indexed(&self, uri: &str) -> Result<bool, MirrorError> {
        Ok(self.view.is_post_indexed(uri))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn upsert_actor(&mut self, did: &str, handle: Option<&str>) -> Result<(), MirrorError> {
        let op = Op::Actor {
            did: did.to_owned(),
            handle: handle.map(str::to_owned),
        };
        self.write("actor", op).map(|_| ())
    }

    async fn upsert_record(&mut self, record: &Record) -> Result<(), MirrorError> {
        self.write("record", Op::Record(record.clone())).map(|_| ())
    }

    async fn upsert_post(&mut self, record: &Record, _post: &Post) -> Result<(), MirrorError> {
        self.write("post", Op::Collection(record.clone())).map(|_| ())
    }

    async fn upsert_profile(
        &mut self,
        record: &Record,
        _profile: &Profile,
    ) -> Result<(), MirrorError> {
        self.write("profile", Op::Collection(record.clone()))
            .map(|_| ())
    }

    async fn upsert_follow(&mut self, record: &Record, _follow: &Follow) -> Result<(), MirrorError> {
        self.write("follow", Op::Collection(record.clone()))
            .map(|_| ())
    }

    async fn upsert_like(&mut self, record: &Record, _like: &Like) -> Result<(), MirrorError> {
        self.write("like", Op::Collection(record.clone())).map(|_| ())
    }

    async fn upsert_repost(&mut self, record: &Record, _repost: &Repost) -> Result<(), MirrorError> {
        self.write("repost", Op::Collection(record.clone()))
            .map(|_| ())
    }

    async fn upsert_generator(
        &mut self,
        record: &Record,
        _generator: &Generator,
    ) -> Result<(), MirrorError> {
        self.write("feed_generator", Op::Collection(record.clone()))
            .map(|_| ())
    }

    async fn upsert_subscription(
        &mut self,
        record: &Record,
        _subscription: &Subscription,
    ) -> Result<(), MirrorError> {
        self.write("subscription", Op::Collection(record.clone()))
            .map(|_| ())
    }

    async fn delete_record(
        &mut self,
        uri: &AtUri,
        collection: Collection,
    ) -> Result<Option<RemovedRow>, MirrorError> {
        self.write(table_of(collection), Op::Delete(uri.clone(), collection))
    }

    async fn commit(self: Box<Self>) -> Result<(), MirrorError> {
        let mut state = lock(&self.shared);
        for op in &self.ops {
            state.apply(op);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), MirrorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(uri: &str, json: serde_json::Value) -> Record {
        Record::new(AtUri::parse(uri).unwrap(), "bafytest", json).unwrap()
    }

    fn subscription(did: &str) -> Record {
        record(
            &format!("at://{did}/xyz.blacksky.mirror.subscription/self"),
            json!({"appviewDid": "did:web:mirror.test", "createdAt": "2024-01-01T00:00:00Z"}),
        )
    }

    fn follow(did: &str, rkey: &str, subject: &str) -> Record {
        record(
            &format!("at://{did}/app.bsky.graph.follow/{rkey}"),
            json!({"subject": subject, "createdAt": "2024-01-01T00:00:00Z"}),
        )
    }

    async fn write(db: &MemoryDatabase, record: &Record) {
        let mut uow = db.begin().await.unwrap();
        uow.upsert_actor(record.author(), None).await.unwrap();
        uow.upsert_record(record).await.unwrap();
        match record.value() {
            TypedRecord::Subscription(s) => uow.upsert_subscription(record, s).await.unwrap(),
            TypedRecord::Follow(f) => uow.upsert_follow(record, f).await.unwrap(),
            TypedRecord::Post(p) => uow.upsert_post(record, p).await.unwrap(),
            _ => unreachable!(),
        }
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_tracked_set_derivation() {
        let db = MemoryDatabase::new();
        write(&db, &subscription("did:plc:sub")).await;
        write(&db, &follow("did:plc:sub", "f1", "did:plc:friend")).await;
        write(&db, &follow("did:plc:friend", "f2", "did:plc:fof")).await;
        write(&db, &follow("did:plc:stranger", "f3", "did:plc:other")).await;

        assert!(db.is_tracked("did:plc:sub").await.unwrap());
        assert!(db.is_tracked("did:plc:friend").await.unwrap());
        assert!(!db.is_tracked("did:plc:fof").await.unwrap());
        assert!(!db.is_tracked("did:plc:stranger").await.unwrap());

        assert!(db.has_tracked_follower("did:plc:fof").await.unwrap());
        assert!(!db.has_tracked_follower("did:plc:other").await.unwrap());

        let among = db
            .tracked_among(&[
                "did:plc:friend".to_owned(),
                "did:plc:fof".to_owned(),
                "did:plc:sub".to_owned(),
            ])
            .await
            .unwrap();
        assert_eq!(among.len(), 2);
        assert!(among.contains("did:plc:friend"));
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let db = MemoryDatabase::new();
        let rec = subscription("did:plc:sub");
        {
            let mut uow = db.begin().await.unwrap();
            uow.upsert_actor("did:plc:sub", None).await.unwrap();
            uow.upsert_record(&rec).await.unwrap();
            assert!(!uow.is_subscriber("did:plc:sub").await.unwrap());
            if let TypedRecord::Subscription(s) = rec.value() {
                uow.upsert_subscription(&rec, s).await.unwrap();
            }
            assert!(uow.is_subscriber("did:plc:sub").await.unwrap());
            assert!(!db.is_subscriber("did:plc:sub").await.unwrap());
        }
        let state = db.state();
        assert!(state.actors.is_empty());
        assert!(state.records.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let db = MemoryDatabase::new();
        db.fail_writes_to("follow");
        let rec = follow("did:plc:a", "f1", "did:plc:b");
        let mut uow = db.begin().await.unwrap();
        uow.upsert_record(&rec).await.unwrap();
        let TypedRecord::Follow(f) = rec.value() else {
            unreachable!()
        };
        assert!(uow.upsert_follow(&rec, f).await.is_err());
        uow.rollback().await.unwrap();
        assert!(db.state().records.is_empty());
    }

    #[tokio::test]
    async fn test_delete_returns_removed_row_and_recounts() {
        let db = MemoryDatabase::new();
        let rec = follow("did:plc:a", "f1", "did:plc:b");
        write(&db, &rec).await;
        assert_eq!(
            db.refresh_actor_stat("did:plc:b", ActorStat::Followers)
                .await
                .unwrap(),
            1
        );

        let mut uow = db.begin().await.unwrap();
        let removed = uow
            .delete_record(rec.uri(), Collection::Follow)
            .await
            .unwrap();
        uow.commit().await.unwrap();
        assert_eq!(
            removed,
            Some(RemovedRow::Follow {
                creator: "did:plc:a".to_owned(),
                subject: "did:plc:b".to_owned()
            })
        );
        assert!(db.state().records.is_empty());
        assert_eq!(
            db.refresh_actor_stat("did:plc:b", ActorStat::Followers)
                .await
                .unwrap(),
            0
        );
        assert_eq!(db.state().profile_agg["did:plc:b"].followers_count, 0);
    }

    #[tokio::test]
    async fn test_actor_handle_not_cleared() {
        let db = MemoryDatabase::new();
        db.upsert_actor("did:plc:a", Some("a.test")).await.unwrap();
        db.upsert_actor("did:plc:a", None).await.unwrap();
        let actor = db.actor("did:plc:a").await.unwrap().unwrap();
        assert_eq!(actor.handle.as_deref(), Some("a.test"));
        assert_eq!(actor.backfill_status, BackfillStatus::Dirty);

        db.set_backfill_status("did:plc:new", BackfillStatus::InProcess)
            .await
            .unwrap();
        assert_eq!(
            db.backfill_status("did:plc:new"),
            Some(BackfillStatus::InProcess)
        );
    }
}
