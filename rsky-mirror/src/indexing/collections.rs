//! Per-collection writes and the side effects that follow them.
//!
//! Dispatch is a `match` over [`TypedRecord`], so a new collection does not
//! compile until it has a write and an after-action rule here.

use crate::db::{ActorStat, BackfillStatus, IndexReader, PostStat, RemovedRow, UnitOfWork};
use crate::indexing::IndexContext;
use crate::lexicon::{Collection, TypedRecord};
use crate::record::Record;
use crate::types::MirrorError;

/// Work to do once the transaction that produced it has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterAction {
    PostStats { uri: String, stat: PostStat },
    ActorStats { did: String, stat: ActorStat },
    FetchRecord { uri: String, depth: u32, live: bool },
    ResolveDid { did: String },
    Backfill { did: String },
    Track { did: String },
    Untrack { did: String },
    ForgetTracked,
}

pub(crate) async fn upsert(uow: &mut dyn UnitOfWork, record: &Record) -> Result<(), MirrorError> {
    match record.value() {
        TypedRecord::Post(post) => uow.upsert_post(record, post).await,
        TypedRecord::Profile(profile) => uow.upsert_profile(record, profile).await,
        TypedRecord::Follow(follow) => {
            uow.upsert_actor(&follow.subject, None).await?;
            uow.upsert_follow(record, follow).await
        }
        TypedRecord::Like(like) => uow.upsert_like(record, like).await,
        TypedRecord::Repost(repost) => uow.upsert_repost(record, repost).await,
        TypedRecord::Generator(generator) => uow.upsert_generator(record, generator).await,
        TypedRecord::Subscription(subscription) => {
            uow.upsert_subscription(record, subscription).await
        }
    }
}

fn profile_uri(did: &str) -> String {
    format!("at://{did}/{}/self", Collection::Profile.nsid())
}

/// Side effects of admitting `record`, read against the transaction that
/// wrote it.
pub(crate) async fn after_actions<R: IndexReader + ?Sized>(
    reader: &R,
    record: &Record,
    ctx: IndexContext,
    service_did: Option<&str>,
) -> Result<Vec<AfterAction>, MirrorError> {
    let author = record.author();
    let mut actions = Vec::new();
    match record.value() {
        TypedRecord::Post(post) => {
            actions.push(AfterAction::ActorStats {
                did: author.to_owned(),
                stat: ActorStat::Posts,
            });
            if let Some(reply) = &post.reply {
                actions.push(AfterAction::PostStats {
                    uri: reply.parent.uri.clone(),
                    stat: PostStat::Reply,
                });
            }
            if let Some(quoted) = post.quoted_uri() {
                if !reader.is_post_indexed(quoted).await? {
                    actions.push(AfterAction::FetchRecord {
                        uri: quoted.to_owned(),
                        depth: ctx.depth + 1,
                        live: ctx.live,
                    });
                }
            }
        }
        TypedRecord::Profile(_) => {
            let has_handle = reader
                .actor(author)
                .await?
                .is_some_and(|actor| actor.handle.is_some());
            if !has_handle {
                actions.push(AfterAction::ResolveDid {
                    did: author.to_owned(),
                });
            }
        }
        TypedRecord::Follow(follow) => {
            actions.push(AfterAction::ActorStats {
                did: follow.subject.clone(),
                stat: ActorStat::Followers,
            });
            actions.push(AfterAction::ActorStats {
                did: author.to_owned(),
                stat: ActorStat::Follows,
            });
            if reader.is_subscriber(author).await? {
                actions.push(AfterAction::Track {
                    did: follow.subject.clone(),
                });
                actions.push(AfterAction::FetchRecord {
                    uri: profile_uri(&follow.subject),
                    depth: ctx.depth + 1,
                    live: false,
                });
            }
        }
        TypedRecord::Like(like) => {
            actions.push(AfterAction::PostStats {
                uri: like.subject.uri.clone(),
                stat: PostStat::Like,
            });
        }
        TypedRecord::Repost(repost) => {
            actions.push(AfterAction::PostStats {
                uri: repost.subject.uri.clone(),
                stat: PostStat::Repost,
            });
            if !reader.is_post_indexed(&repost.subject.uri).await? {
                actions.push(AfterAction::FetchRecord {
                    uri: repost.subject.uri.clone(),
                    depth: ctx.depth + 1,
                    live: false,
                });
            }
        }
        TypedRecord::Generator(_) => {}
        TypedRecord::Subscription(subscription) => {
            actions.push(AfterAction::Track {
                did: author.to_owned(),
            });
            let for_us = service_did.is_none_or(|did| did == subscription.appview_did);
            let dirty = reader
                .actor(author)
                .await?
                .is_none_or(|actor| actor.backfill_status == BackfillStatus::Dirty);
            if for_us && dirty {
                actions.push(AfterAction::Backfill {
                    did: author.to_owned(),
                });
            }
        }
    }
    Ok(actions)
}

/// Side effects of removing a row: the recounts its creation scheduled, and
/// cache invalidation for rows that defined the tracked set.
pub(crate) fn removal_actions(removed: &RemovedRow) -> Vec<AfterAction> {
    match removed {
        RemovedRow::Post {
            creator,
            reply_parent,
        } => {
            let mut actions = vec![AfterAction::ActorStats {
                did: creator.clone(),
                stat: ActorStat::Posts,
            }];
            if let Some(parent) = reply_parent {
                actions.push(AfterAction::PostStats {
                    uri: parent.clone(),
                    stat: PostStat::Reply,
                });
            }
            actions
        }
        RemovedRow::Follow { creator, subject } => vec![
            AfterAction::ActorStats {
                did: subject.clone(),
                stat: ActorStat::Followers,
            },
            AfterAction::ActorStats {
                did: creator.clone(),
                stat: ActorStat::Follows,
            },
            AfterAction::Untrack {
                did: subject.clone(),
            },
        ],
        RemovedRow::Like { subject, .. } => vec![AfterAction::PostStats {
            uri: subject.clone(),
            stat: PostStat::Like,
        }],
        RemovedRow::Repost { subject, .. } => vec![AfterAction::PostStats {
            uri: subject.clone(),
            stat: PostStat::Repost,
        }],
        // the subscriber's followees may be cached as tracked too
        RemovedRow::Subscription { .. } => vec![AfterAction::ForgetTracked],
        RemovedRow::Profile { .. } | RemovedRow::Generator { .. } => Vec::new(),
    }
}
