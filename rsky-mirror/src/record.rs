use crate::lexicon::{self, Collection, TypedRecord};
use crate::types::MirrorError;
use crate::uri::AtUri;
use chrono::{DateTime, Utc};

/// A validated record. Only obtainable through [`Record::new`], so every
/// instance has passed its collection's lexicon.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    uri: AtUri,
    cid: String,
    json: serde_json::Value,
    value: TypedRecord,
    indexed_at: DateTime<Utc>,
}

impl Record {
    /// Fails with `UnsupportedCollection` when the uri names a collection
    /// outside [`Collection::ALL`], and with a validation error when the
    /// payload does not match its lexicon.
    pub fn new(uri: AtUri, cid: impl Into<String>, json: serde_json::Value) -> Result<Self, MirrorError> {
        let collection = Collection::from_nsid(uri.collection())
            .ok_or_else(|| MirrorError::UnsupportedCollection(uri.collection().to_owned()))?;
        let value = lexicon::validate(collection, &json)?;
        Ok(Self {
            uri,
            cid: cid.into(),
            json,
            value,
            indexed_at: Utc::now(),
        })
    }

    #[must_use]
    pub fn with_indexed_at(mut self, indexed_at: DateTime<Utc>) -> Self {
        self.indexed_at = indexed_at;
        self
    }

    #[must_use]
    pub const fn uri(&self) -> &AtUri {
        &self.uri
    }

    #[must_use]
    pub fn author(&self) -> &str {
        self.uri.did()
    }

    #[must_use]
    pub fn cid(&self) -> &str {
        &self.cid
    }

    #[must_use]
    pub const fn json(&self) -> &serde_json::Value {
        &self.json
    }

    #[must_use]
    pub const fn value(&self) -> &TypedRecord {
        &self.value
    }

    #[must_use]
    pub const fn collection(&self) -> Collection {
        self.value.collection()
    }

    #[must_use]
    pub const fn indexed_at(&self) -> DateTime<Utc> {
        self.indexed_at
    }

    /// Earlier of the declared creation time and the indexing time, so a
    /// client-supplied future timestamp cannot float a record to the top.
    #[must_use]
    pub fn sort_at(&self) -> DateTime<Utc> {
        self.value
            .created_at()
            .and_then(lexicon::parse_datetime)
            .map(|created| created.with_timezone(&Utc))
            .map_or(self.indexed_at, |created| created.min(self.indexed_at))
    }

    /// Postgres cannot store `\u0000` in text or jsonb.
    #[must_use]
    pub fn contains_nul(&self) -> bool {
        json_contains_nul(&self.json)
    }
}

pub fn json_contains_nul(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains('\0'),
        serde_json::Value::Array(items) => items.iter().any(json_contains_nul),
        serde_json::Value::Object(map) => map
            .iter()
            .any(|(k, v)| k.contains('\0') || json_contains_nul(v)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::TypedRecord;
    use serde_json::json;

    fn post_uri() -> AtUri {
        AtUri::parse("at://did:plc:alice/app.bsky.feed.post/3kabc").unwrap()
    }

    #[test]
    fn test_new_validates() {
        let record = Record::new(
            post_uri(),
            "bafypost",
            json!({"text": "hello", "createdAt": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        assert_eq!(record.author(), "did:plc:alice");
        assert_eq!(record.collection(), Collection::Post);
        assert!(matches!(record.value(), TypedRecord::Post(p) if p.text == "hello"));

        let err = Record::new(post_uri(), "bafypost", json!({"text": 5})).unwrap_err();
        assert!(err.is_skippable());
    }

    #[test]
    fn test_unsupported_collection_is_fatal() {
        let uri = AtUri::parse("at://did:plc:alice/app.bsky.graph.block/1").unwrap();
        let err = Record::new(uri, "bafy", json!({})).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_contains_nul() {
        let record = Record::new(
            post_uri(),
            "bafypost",
            json!({"text": "bad\u{0}byte", "createdAt": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        assert!(record.contains_nul());
        assert!(json_contains_nul(&json!({"a": [{"b\u{0}": 1}]})));
        assert!(!json_contains_nul(&json!({"a": ["\\u0000 literal"]})));
    }

    #[test]
    fn test_sort_at_clamps_future_created_at() {
        let now = Utc::now();
        let record = Record::new(
            post_uri(),
            "bafypost",
            json!({"text": "from the future", "createdAt": "2999-01-01T00:00:00Z"}),
        )
        .unwrap()
        .with_indexed_at(now);
        assert_eq!(record.sort_at(), now);

        let past = Record::new(
            post_uri(),
            "bafypost",
            json!({"text": "old", "createdAt": "2020-01-01T00:00:00Z"}),
        )
        .unwrap()
        .with_indexed_at(now);
        assert!(past.sort_at() < now);
    }
}
