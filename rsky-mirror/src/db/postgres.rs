use super::{
    Actor, ActorStat, BackfillStatus, Database, IndexReader, PostStat, RemovedRow, UnitOfWork,
};
use crate::lexicon::{Collection, Follow, Generator, Like, Post, Profile, Repost, Subscription};
use crate::record::Record;
use crate::types::MirrorError;
use crate::uri::AtUri;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use std::collections::HashSet;
use tokio_postgres::{Client, NoTls};

const SCHEMA: &str = include_str!("schema.sql");

const IS_SUBSCRIBER: &str = "SELECT EXISTS (SELECT 1 FROM subscription WHERE creator = $1)";

const IS_TRACKED: &str = "SELECT EXISTS (SELECT 1 FROM subscription WHERE creator = $1)
     OR EXISTS (
       SELECT 1 FROM follow f
       JOIN subscription s ON s.creator = f.creator
       WHERE f.\"subjectDid\" = $1
     )";

const TRACKED_AMONG: &str = "SELECT creator AS did FROM subscription WHERE creator = ANY($1)
     UNION
     SELECT f.\"subjectDid\" AS did FROM follow f
     JOIN subscription s ON s.creator = f.creator
     WHERE f.\"subjectDid\" = ANY($1)";

const HAS_TRACKED_FOLLOWER: &str = "SELECT EXISTS (
       SELECT 1 FROM follow f
       WHERE f.\"subjectDid\" = $1
         AND (
           EXISTS (SELECT 1 FROM subscription s WHERE s.creator = f.creator)
           OR EXISTS (
             SELECT 1 FROM follow f2
             JOIN subscription s2 ON s2.creator = f2.creator
             WHERE f2.\"subjectDid\" = f.creator
           )
         )
     )";

const IS_POST_INDEXED: &str = "SELECT EXISTS (SELECT 1 FROM post WHERE uri = $1)";

const SELECT_ACTOR: &str =
    "SELECT did, handle, \"backfillStatus\" FROM actor WHERE did = $1";

const UPSERT_ACTOR: &str = "INSERT INTO actor (did, handle, \"indexedAt\")
     VALUES ($1, $2, $3)
     ON CONFLICT (did) DO UPDATE SET handle = COALESCE(EXCLUDED.handle, actor.handle)";

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// CID of a blob reference, in either the current (`ref.$link`) or legacy
/// (`cid`) shape.
fn blob_cid(blob: Option<&serde_json::Value>) -> Option<String> {
    let blob = blob?;
    blob.get("ref")
        .and_then(|r| r.get("$link"))
        .or_else(|| blob.get("cid"))
        .and_then(|c| c.as_str())
        .map(str::to_owned)
}

const fn post_stat_sql(stat: PostStat) -> &'static str {
    match stat {
        PostStat::Like => {
            "INSERT INTO post_agg (uri, \"likeCount\")
             SELECT $1::varchar, COUNT(*) FROM \"like\" WHERE subject = $1
             ON CONFLICT (uri) DO UPDATE SET \"likeCount\" = EXCLUDED.\"likeCount\"
             RETURNING \"likeCount\""
        }
        PostStat::Repost => {
            "INSERT INTO post_agg (uri, \"repostCount\")
             SELECT $1::varchar, COUNT(*) FROM repost WHERE subject = $1
             ON CONFLICT (uri) DO UPDATE SET \"repostCount\" = EXCLUDED.\"repostCount\"
             RETURNING \"repostCount\""
        }
        PostStat::Reply => {
            "INSERT INTO post_agg (uri, \"replyCount\")
             SELECT $1::varchar, COUNT(*) FROM post WHERE \"replyParent\" = $1
             ON CONFLICT (uri) DO UPDATE SET \"replyCount\" = EXCLUDED.\"replyCount\"
             RETURNING \"replyCount\""
        }
    }
}

const fn actor_stat_sql(stat: ActorStat) -> &'static str {
    match stat {
        ActorStat::Followers => {
            "INSERT INTO profile_agg (did, \"followersCount\")
             SELECT $1::varchar, COUNT(*) FROM follow WHERE \"subjectDid\" = $1
             ON CONFLICT (did) DO UPDATE SET \"followersCount\" = EXCLUDED.\"followersCount\"
             RETURNING \"followersCount\""
        }
        ActorStat::Follows => {
            "INSERT INTO profile_agg (did, \"followsCount\")
             SELECT $1::varchar, COUNT(*) FROM follow WHERE creator = $1
             ON CONFLICT (did) DO UPDATE SET \"followsCount\" = EXCLUDED.\"followsCount\"
             RETURNING \"followsCount\""
        }
        ActorStat::Posts => {
            "INSERT INTO profile_agg (did, \"postsCount\")
             SELECT $1::varchar, COUNT(*) FROM post WHERE creator = $1
             ON CONFLICT (did) DO UPDATE SET \"postsCount\" = EXCLUDED.\"postsCount\"
             RETURNING \"postsCount\""
        }
    }
}

async fn exists(client: &Client, sql: &str, key: &str) -> Result<bool, MirrorError> {
    let row = client.query_one(sql, &[&key]).await?;
    Ok(row.try_get(0)?)
}

async fn select_actor(client: &Client, did: &str) -> Result<Option<Actor>, MirrorError> {
    let Some(row) = client.query_opt(SELECT_ACTOR, &[&did]).await? else {
        return Ok(None);
    };
    let status: String = row.try_get("backfillStatus")?;
    Ok(Some(Actor {
        did: row.try_get("did")?,
        handle: row.try_get("handle")?,
        backfill_status: status.parse()?,
    }))
}

async fn tracked_among(client: &Client, dids: &[String]) -> Result<HashSet<String>, MirrorError> {
    if dids.is_empty() {
        return Ok(HashSet::new());
    }
    let rows = client.query(TRACKED_AMONG, &[&dids]).await?;
    rows.iter()
        .map(|row| row.try_get::<_, String>("did").map_err(MirrorError::from))
        .collect()
}

pub struct PgDatabase {
    pool: Pool,
}

impl PgDatabase {
    pub fn new(database_url: String, pool_size: usize) -> Result<Self, MirrorError> {
        tracing::info!("mirror DB pool size: {pool_size}");
        let mut pg_config = Config::new();
        pg_config.url = Some(database_url);
        pg_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pg_config.pool = Some(deadpool_postgres::PoolConfig::new(pool_size));

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| MirrorError::Other(format!("pool creation failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Applies `schema.sql`. Every statement is `IF NOT EXISTS`.
    pub async fn migrate(&self) -> Result<(), MirrorError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        tracing::info!("database schema applied");
        Ok(())
    }
}

#[async_trait]
impl IndexReader for PgDatabase {
    async fn actor(&self, did: &str) -> Result<Option<Actor>, MirrorError> {
        let client = self.pool.get().await?;
        select_actor(&client, did).await
    }

    async fn is_subscriber(&self, did: &str) -> Result<bool, MirrorError> {
        let client = self.pool.get().await?;
        exists(&client, IS_SUBSCRIBER, did).await
    }

    async fn is_tracked(&self, did: &str) -> Result<bool, MirrorError> {
        let client = self.pool.get().await?;
        exists(&client, IS_TRACKED, did).await
    }

    async fn tracked_among(&self, dids: &[String]) -> Result<HashSet<String>, MirrorError> {
        let client = self.pool.get().await?;
        tracked_among(&client, dids).await
    }

    async fn has_tracked_follower(&self, did: &str) -> Result<bool, MirrorError> {
        let client = self.pool.get().await?;
        exists(&client, HAS_TRACKED_FOLLOWER, did).await
    }

    async fn is_post_indexed(&self, uri: &str) -> Result<bool, MirrorError> {
        let client = self.pool.get().await?;
        exists(&client, IS_POST_INDEXED, uri).await
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, MirrorError> {
        let client = self.pool.get().await?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PgUnitOfWork {
            client: Some(client),
        }))
    }

    async fn upsert_actor(&self, did: &str, handle: Option<&str>) -> Result<(), MirrorError> {
        let client = self.pool.get().await?;
        client
            .execute(UPSERT_ACTOR, &[&did, &handle, &timestamp(Utc::now())])
            .await?;
        Ok(())
    }

    async fn set_backfill_status(
        &self,
        did: &str,
        status: BackfillStatus,
    ) -> Result<(), MirrorError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO actor (did, \"indexedAt\", \"backfillStatus\")
                 VALUES ($1, $2, $3)
                 ON CONFLICT (did) DO UPDATE SET \"backfillStatus\" = EXCLUDED.\"backfillStatus\"",
                &[&did, &timestamp(Utc::now()), &status.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn refresh_post_stat(&self, uri: &str, stat: PostStat) -> Result<i64, MirrorError> {
        let client = self.pool.get().await?;
        let row = client.query_one(post_stat_sql(stat), &[&uri]).await?;
        Ok(row.try_get(0)?)
    }

    async fn refresh_actor_stat(&self, did: &str, stat: ActorStat) -> Result<i64, MirrorError> {
        let client = self.pool.get().await?;
        let row = client.query_one(actor_stat_sql(stat), &[&did]).await?;
        Ok(row.try_get(0)?)
    }
}

/// An open `BEGIN` on a pooled connection.
pub struct PgUnitOfWork {
    client: Option<Object>,
}

impl PgUnitOfWork {
    fn client(&self) -> Result<&Client, MirrorError> {
        self.client
            .as_deref()
            .map(|wrapper| &**wrapper)
            .ok_or_else(|| MirrorError::Other("transaction already finished".into()))
    }
}

impl Drop for PgUnitOfWork {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            // never hand a connection with an open transaction back to the pool
            tracing::debug!("discarding connection with uncommitted transaction");
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl IndexReader for PgUnitOfWork {
    async fn actor(&self, did: &str) -> Result<Option<Actor>, MirrorError> {
        select_actor(self.client()?, did).await
    }

    async fn is_subscriber(&self, did: &str) -> Result<bool, MirrorError> {
        exists(self.client()?, IS_SUBSCRIBER, did).await
    }

    async fn is_tracked(&self, did: &str) -> Result<bool, MirrorError> {
        exists(self.client()?, IS_TRACKED, did).await
    }

    async fn tracked_among(&self, dids: &[String]) -> Result<HashSet<String>, MirrorError> {
        tracked_among(self.client()?, dids).await
    }

    async fn has_tracked_follower(&self, did: &str) -> Result<bool, MirrorError> {
        exists(self.client()?, HAS_TRACKED_FOLLOWER, did).await
    }

    async fn is_post_indexed(&self, uri: &str) -> Result<bool, MirrorError> {
        exists(self.client()?, IS_POST_INDEXED, uri).await
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn upsert_actor(&mut self, did: &str, handle: Option<&str>) -> Result<(), MirrorError> {
        self.client()?
            .execute(UPSERT_ACTOR, &[&did, &handle, &timestamp(Utc::now())])
            .await?;
        Ok(())
    }

    async fn upsert_record(&mut self, record: &Record) -> Result<(), MirrorError> {
        let json = serde_json::to_string(record.json())
            .map_err(|e| MirrorError::Serialization(format!("json stringify failed: {e}")))?;
        self.client()?
            .execute(
                "INSERT INTO record (uri, cid, did, json, \"indexedAt\")
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (uri) DO UPDATE SET
                   cid = EXCLUDED.cid,
                   json = EXCLUDED.json,
                   \"indexedAt\" = EXCLUDED.\"indexedAt\"",
                &[
                    &record.uri().to_string(),
                    &record.cid(),
                    &record.author(),
                    &json,
                    &timestamp(record.indexed_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_post(&mut self, record: &Record, post: &Post) -> Result<(), MirrorError> {
        let reply = post.reply.as_ref();
        let langs = post.langs.as_ref().map(|l| serde_json::json!(l));
        self.client()?
            .execute(
                "INSERT INTO post (uri, cid, creator, text, \"replyRoot\", \"replyRootCid\",
                   \"replyParent\", \"replyParentCid\", \"quoteUri\", langs, \"createdAt\",
                   \"indexedAt\", \"sortAt\")
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (uri) DO UPDATE SET
                   cid = EXCLUDED.cid,
                   text = EXCLUDED.text,
                   \"replyRoot\" = EXCLUDED.\"replyRoot\",
                   \"replyRootCid\" = EXCLUDED.\"replyRootCid\",
                   \"replyParent\" = EXCLUDED.\"replyParent\",
                   \"replyParentCid\" = EXCLUDED.\"replyParentCid\",
                   \"quoteUri\" = EXCLUDED.\"quoteUri\",
                   langs = EXCLUDED.langs,
                   \"createdAt\" = EXCLUDED.\"createdAt\",
                   \"indexedAt\" = EXCLUDED.\"indexedAt\",
                   \"sortAt\" = EXCLUDED.\"sortAt\"",
                &[
                    &record.uri().to_string(),
                    &record.cid(),
                    &record.author(),
                    &post.text,
                    &reply.map(|r| r.root.uri.as_str()),
                    &reply.map(|r| r.root.cid.as_str()),
                    &reply.map(|r| r.parent.uri.as_str()),
                    &reply.map(|r| r.parent.cid.as_str()),
                    &post.quoted_uri(),
                    &langs,
                    &post.created_at,
                    &timestamp(record.indexed_at()),
                    &timestamp(record.sort_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_profile(
        &mut self,
        record: &Record,
        profile: &Profile,
    ) -> Result<(), MirrorError> {
        self.client()?
            .execute(
                "INSERT INTO profile (uri, cid, creator, \"displayName\", description,
                   \"avatarCid\", \"bannerCid\", \"createdAt\", \"indexedAt\")
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (uri) DO UPDATE SET
                   cid = EXCLUDED.cid,
                   \"displayName\" = EXCLUDED.\"displayName\",
                   description = EXCLUDED.description,
                   \"avatarCid\" = EXCLUDED.\"avatarCid\",
                   \"bannerCid\" = EXCLUDED.\"bannerCid\",
                   \"createdAt\" = EXCLUDED.\"createdAt\",
                   \"indexedAt\" = EXCLUDED.\"indexedAt\"",
                &[
                    &record.uri().to_string(),
                    &record.cid(),
                    &record.author(),
                    &profile.display_name,
                    &profile.description,
                    &blob_cid(profile.avatar.as_ref()),
                    &blob_cid(profile.banner.as_ref()),
                    &profile.created_at,
                    &timestamp(record.indexed_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_follow(&mut self, record: &Record, follow: &Follow) -> Result<(), MirrorError> {
        self.client()?
            .execute(
                "INSERT INTO follow (uri, cid, creator, \"subjectDid\", \"createdAt\",
                   \"indexedAt\", \"sortAt\")
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (uri) DO UPDATE SET
                   cid = EXCLUDED.cid,
                   \"subjectDid\" = EXCLUDED.\"subjectDid\",
                   \"createdAt\" = EXCLUDED.\"createdAt\",
                   \"indexedAt\" = EXCLUDED.\"indexedAt\",
                   \"sortAt\" = EXCLUDED.\"sortAt\"",
                &[
                    &record.uri().to_string(),
                    &record.cid(),
                    &record.author(),
                    &follow.subject,
                    &follow.created_at,
                    &timestamp(record.indexed_at()),
                    &timestamp(record.sort_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_like(&mut self, record: &Record, like: &Like) -> Result<(), MirrorError> {
        self.client()?
            .execute(
                "INSERT INTO \"like\" (uri, cid, creator, subject, \"subjectCid\", \"createdAt\",
                   \"indexedAt\", \"sortAt\")
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (uri) DO UPDATE SET
                   cid = EXCLUDED.cid,
                   subject = EXCLUDED.subject,
                   \"subjectCid\" = EXCLUDED.\"subjectCid\",
                   \"createdAt\" = EXCLUDED.\"createdAt\",
                   \"indexedAt\" = EXCLUDED.\"indexedAt\",
                   \"sortAt\" = EXCLUDED.\"sortAt\"",
                &[
                    &record.uri().to_string(),
                    &record.cid(),
                    &record.author(),
                    &like.subject.uri,
                    &like.subject.cid,
                    &like.created_at,
                    &timestamp(record.indexed_at()),
                    &timestamp(record.sort_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_repost(&mut self, record: &Record, repost: &Repost) -> Result<(), MirrorError> {
        self.client()?
            .execute(
                "INSERT INTO repost (uri, cid, creator, subject, \"subjectCid\", \"createdAt\",
                   \"indexedAt\", \"sortAt\")
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (uri) DO UPDATE SET
                   cid = EXCLUDED.cid,
                   subject = EXCLUDED.subject,
                   \"subjectCid\" = EXCLUDED.\"subjectCid\",
                   \"createdAt\" = EXCLUDED.\"createdAt\",
                   \"indexedAt\" = EXCLUDED.\"indexedAt\",
                   \"sortAt\" = EXCLUDED.\"sortAt\"",
                &[
                    &record.uri().to_string(),
                    &record.cid(),
                    &record.author(),
                    &repost.subject.uri,
                    &repost.subject.cid,
                    &repost.created_at,
                    &timestamp(record.indexed_at()),
                    &timestamp(record.sort_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_generator(
        &mut self,
        record: &Record,
        generator: &Generator,
    ) -> Result<(), MirrorError> {
        self.client()?
            .execute(
                "INSERT INTO feed_generator (uri, cid, creator, \"feedDid\", \"displayName\",
                   description, \"createdAt\", \"indexedAt\")
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (uri) DO UPDATE SET
                   cid = EXCLUDED.cid,
                   \"feedDid\" = EXCLUDED.\"feedDid\",
                   \"displayName\" = EXCLUDED.\"displayName\",
                   description = EXCLUDED.description,
                   \"createdAt\" = EXCLUDED.\"createdAt\",
                   \"indexedAt\" = EXCLUDED.\"indexedAt\"",
                &[
                    &record.uri().to_string(),
                    &record.cid(),
                    &record.author(),
                    &generator.did,
                    &generator.display_name,
                    &generator.description,
                    &generator.created_at,
                    &timestamp(record.indexed_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_subscription(
        &mut self,
        record: &Record,
        subscription: &Subscription,
    ) -> Result<(), MirrorError> {
        self.client()?
            .execute(
                "INSERT INTO subscription (uri, cid, creator, \"appviewDid\", \"createdAt\",
                   \"indexedAt\")
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (uri) DO UPDATE SET
                   cid = EXCLUDED.cid,
                   \"appviewDid\" = EXCLUDED.\"appviewDid\",
                   \"createdAt\" = EXCLUDED.\"createdAt\",
                   \"indexedAt\" = EXCLUDED.\"indexedAt\"",
                &[
                    &record.uri().to_string(),
                    &record.cid(),
                    &record.author(),
                    &subscription.appview_did,
                    &subscription.created_at,
                    &timestamp(record.indexed_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_record(
        &mut self,
        uri: &AtUri,
        collection: Collection,
    ) -> Result<Option<RemovedRow>, MirrorError> {
        let client = self.client()?;
        let uri = uri.to_string();
        let removed = match collection {
            Collection::Post => client
                .query_opt(
                    "DELETE FROM post WHERE uri = $1 RETURNING creator, \"replyParent\"",
                    &[&uri],
                )
                .await?
                .map(|row| -> Result<_, MirrorError> {
                    Ok(RemovedRow::Post {
                        creator: row.try_get("creator")?,
                        reply_parent: row.try_get("replyParent")?,
                    })
                })
                .transpose()?,
            Collection::Follow => client
                .query_opt(
                    "DELETE FROM follow WHERE uri = $1 RETURNING creator, \"subjectDid\"",
                    &[&uri],
                )
                .await?
                .map(|row| -> Result<_, MirrorError> {
                    Ok(RemovedRow::Follow {
                        creator: row.try_get("creator")?,
                        subject: row.try_get("subjectDid")?,
                    })
                })
                .transpose()?,
            Collection::Like => client
                .query_opt(
                    "DELETE FROM \"like\" WHERE uri = $1 RETURNING creator, subject",
                    &[&uri],
                )
                .await?
                .map(|row| -> Result<_, MirrorError> {
                    Ok(RemovedRow::Like {
                        creator: row.try_get("creator")?,
                        subject: row.try_get("subject")?,
                    })
                })
                .transpose()?,
            Collection::Repost => client
                .query_opt(
                    "DELETE FROM repost WHERE uri = $1 RETURNING creator, subject",
                    &[&uri],
                )
                .await?
                .map(|row| -> Result<_, MirrorError> {
                    Ok(RemovedRow::Repost {
                        creator: row.try_get("creator")?,
                        subject: row.try_get("subject")?,
                    })
                })
                .transpose()?,
            Collection::Profile => client
                .query_opt("DELETE FROM profile WHERE uri = $1 RETURNING creator", &[&uri])
                .await?
                .map(|row| row.try_get("creator").map(|creator| RemovedRow::Profile { creator }))
                .transpose()?,
            Collection::Generator => client
                .query_opt(
                    "DELETE FROM feed_generator WHERE uri = $1 RETURNING creator",
                    &[&uri],
                )
                .await?
                .map(|row| {
                    row.try_get("creator")
                        .map(|creator| RemovedRow::Generator { creator })
                })
                .transpose()?,
            Collection::Subscription => client
                .query_opt(
                    "DELETE FROM subscription WHERE uri = $1 RETURNING creator",
                    &[&uri],
                )
                .await?
                .map(|row| {
                    row.try_get("creator")
                        .map(|creator| RemovedRow::Subscription { creator })
                })
                .transpose()?,
        };
        client
            .execute("DELETE FROM record WHERE uri = $1", &[&uri])
            .await?;
        Ok(removed)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), MirrorError> {
        let client = self
            .client
            .take()
            .ok_or_else(|| MirrorError::Other("transaction already finished".into()))?;
        client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), MirrorError> {
        let client = self
            .client
            .take()
            .ok_or_else(|| MirrorError::Other("transaction already finished".into()))?;
        client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blob_cid_shapes() {
        let current = json!({"$type": "blob", "ref": {"$link": "bafkavatar"}, "mimeType": "image/png"});
        let legacy = json!({"cid": "bafklegacy", "mimeType": "image/jpeg"});
        assert_eq!(blob_cid(Some(&current)).as_deref(), Some("bafkavatar"));
        assert_eq!(blob_cid(Some(&legacy)).as_deref(), Some("bafklegacy"));
        assert_eq!(blob_cid(None), None);
    }

    #[test]
    fn test_schema_covers_every_table() {
        for table in [
            "actor",
            "record",
            "post",
            "profile",
            "follow",
            "\"like\"",
            "repost",
            "feed_generator",
            "subscription",
            "post_agg",
            "profile_agg",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "missing {table}"
            );
        }
        assert!(SCHEMA.contains("\"backfillStatus\" character varying NOT NULL DEFAULT 'dirty'"));
    }

    #[test]
    fn test_stat_sql_targets_matching_column() {
        assert!(post_stat_sql(PostStat::Reply).contains("\"replyParent\" = $1"));
        assert!(actor_stat_sql(ActorStat::Followers).contains("\"subjectDid\" = $1"));
        assert!(actor_stat_sql(ActorStat::Posts).contains("FROM post WHERE creator"));
    }
}
