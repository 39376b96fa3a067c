//! The closed set of record types this service stores, their typed shapes,
//! and the validator that turns a decoded payload into one of them.

use crate::types::RecordValidationError;
use crate::uri::AtUri;
use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SUBSCRIPTION_NSID: &str = "xyz.blacksky.mirror.subscription";

const POST_TEXT_MAX_BYTES: usize = 3000;
const PROFILE_DISPLAY_NAME_MAX_BYTES: usize = 640;
const PROFILE_DESCRIPTION_MAX_BYTES: usize = 2560;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "app.bsky.feed.post")]
    Post,
    #[serde(rename = "app.bsky.actor.profile")]
    Profile,
    #[serde(rename = "app.bsky.graph.follow")]
    Follow,
    #[serde(rename = "app.bsky.feed.like")]
    Like,
    #[serde(rename = "app.bsky.feed.repost")]
    Repost,
    #[serde(rename = "app.bsky.feed.generator")]
    Generator,
    #[serde(rename = "xyz.blacksky.mirror.subscription")]
    Subscription,
}

impl Collection {
    pub const ALL: [Self; 7] = [
        Self::Post,
        Self::Profile,
        Self::Follow,
        Self::Like,
        Self::Repost,
        Self::Generator,
        Self::Subscription,
    ];

    #[must_use]
    pub const fn nsid(self) -> &'static str {
        match self {
            Self::Post => "app.bsky.feed.post",
            Self::Profile => "app.bsky.actor.profile",
            Self::Follow => "app.bsky.graph.follow",
            Self::Like => "app.bsky.feed.like",
            Self::Repost => "app.bsky.feed.repost",
            Self::Generator => "app.bsky.feed.generator",
            Self::Subscription => SUBSCRIPTION_NSID,
        }
    }

    #[must_use]
    pub fn from_nsid(nsid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.nsid() == nsid)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nsid())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub text: String,
    pub created_at: String,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub embed: Option<serde_json::Value>,
    #[serde(default)]
    pub langs: Option<Vec<String>>,
}

impl Post {
    /// The post quoted by this post, if it embeds one. Embedded lists,
    /// feed generators and malformed uris are not quotes.
    #[must_use]
    pub fn quoted_uri(&self) -> Option<&str> {
        let embed = self.embed.as_ref()?;
        let link = match embed.get("$type").and_then(|t| t.as_str())? {
            "app.bsky.embed.record" => embed.get("record"),
            "app.bsky.embed.recordWithMedia" => embed.get("record").and_then(|r| r.get("record")),
            _ => None,
        }?;
        let uri = link.get("uri").and_then(|u| u.as_str())?;
        AtUri::parse(uri)
            .is_ok_and(|parsed| parsed.collection() == Collection::Post.nsid())
            .then_some(uri)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar: Option<serde_json::Value>,
    #[serde(default)]
    pub banner: Option<serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follow {
    pub subject: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    pub subject: StrongRef,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repost {
    pub subject: StrongRef,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generator {
    pub did: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: String,
}

/// An actor's opt-in to being mirrored by the appview named in `appview_did`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub appview_did: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedRecord {
    Post(Post),
    Profile(Profile),
    Follow(Follow),
    Like(Like),
    Repost(Repost),
    Generator(Generator),
    Subscription(Subscription),
}

impl TypedRecord {
    #[must_use]
    pub const fn collection(&self) -> Collection {
        match self {
            Self::Post(_) => Collection::Post,
            Self::Profile(_) => Collection::Profile,
            Self::Follow(_) => Collection::Follow,
            Self::Like(_) => Collection::Like,
            Self::Repost(_) => Collection::Repost,
            Self::Generator(_) => Collection::Generator,
            Self::Subscription(_) => Collection::Subscription,
        }
    }

    #[must_use]
    pub fn created_at(&self) -> Option<&str> {
        match self {
            Self::Post(r) => Some(&r.created_at),
            Self::Profile(r) => r.created_at.as_deref(),
            Self::Follow(r) => Some(&r.created_at),
            Self::Like(r) => Some(&r.created_at),
            Self::Repost(r) => Some(&r.created_at),
            Self::Generator(r) => Some(&r.created_at),
            Self::Subscription(r) => Some(&r.created_at),
        }
    }
}

fn invalid(collection: Collection, reason: impl Into<String>) -> RecordValidationError {
    RecordValidationError {
        collection: collection.nsid().to_owned(),
        reason: reason.into(),
    }
}

fn decode<T: DeserializeOwned>(
    collection: Collection,
    value: &serde_json::Value,
) -> Result<T, RecordValidationError> {
    T::deserialize(value).map_err(|e| invalid(collection, e.to_string()))
}

pub fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

fn check_datetime(collection: Collection, field: &str, s: &str) -> Result<(), RecordValidationError> {
    parse_datetime(s)
        .map(|_| ())
        .ok_or_else(|| invalid(collection, format!("{field} is not a datetime: {s}")))
}

fn check_strong_ref(
    collection: Collection,
    subject: &StrongRef,
) -> Result<(), RecordValidationError> {
    AtUri::parse(&subject.uri)
        .map_err(|_| invalid(collection, format!("subject is not an at-uri: {}", subject.uri)))?;
    if subject.cid.is_empty() {
        return Err(invalid(collection, "subject cid is empty"));
    }
    Ok(())
}

fn check_max(
    collection: Collection,
    field: &str,
    value: Option<&str>,
    max: usize,
) -> Result<(), RecordValidationError> {
    match value {
        Some(v) if v.len() > max => Err(invalid(
            collection,
            format!("{field} exceeds {max} bytes"),
        )),
        _ => Ok(()),
    }
}

/// Validates `value` against the lexicon of `collection`.
pub fn validate(
    collection: Collection,
    value: &serde_json::Value,
) -> Result<TypedRecord, RecordValidationError> {
    if !value.is_object() {
        return Err(invalid(collection, "record is not an object"));
    }
    if let Some(declared) = value.get("$type") {
        if declared.as_str() != Some(collection.nsid()) {
            return Err(invalid(collection, format!("$type mismatch: {declared}")));
        }
    }

    let typed = match collection {
        Collection::Post => {
            let post: Post = decode(collection, value)?;
            check_max(collection, "text", Some(&post.text), POST_TEXT_MAX_BYTES)?;
            if let Some(reply) = &post.reply {
                check_strong_ref(collection, &reply.root)?;
                check_strong_ref(collection, &reply.parent)?;
            }
            TypedRecord::Post(post)
        }
        Collection::Profile => {
            let profile: Profile = decode(collection, value)?;
            check_max(
                collection,
                "displayName",
                profile.display_name.as_deref(),
                PROFILE_DISPLAY_NAME_MAX_BYTES,
            )?;
            check_max(
                collection,
                "description",
                profile.description.as_deref(),
                PROFILE_DESCRIPTION_MAX_BYTES,
            )?;
            TypedRecord::Profile(profile)
        }
        Collection::Follow => {
            let follow: Follow = decode(collection, value)?;
            if !follow.subject.starts_with("did:") {
                return Err(invalid(collection, "subject is not a did"));
            }
            TypedRecord::Follow(follow)
        }
        Collection::Like => {
            let like: Like = decode(collection, value)?;
            check_strong_ref(collection, &like.subject)?;
            TypedRecord::Like(like)
        }
        Collection::Repost => {
            let repost: Repost = decode(collection, value)?;
            check_strong_ref(collection, &repost.subject)?;
            TypedRecord::Repost(repost)
        }
        Collection::Generator => {
            let generator: Generator = decode(collection, value)?;
            if !generator.did.starts_with("did:") {
                return Err(invalid(collection, "did is not a did"));
            }
            TypedRecord::Generator(generator)
        }
        Collection::Subscription => {
            let subscription: Subscription = decode(collection, value)?;
            if !subscription.appview_did.starts_with("did:") {
                return Err(invalid(collection, "appviewDid is not a did"));
            }
            TypedRecord::Subscription(subscription)
        }
    };

    if let Some(created_at) = typed.created_at() {
        check_datetime(collection, "createdAt", created_at)?;
    }

    Ok(typed)
}
