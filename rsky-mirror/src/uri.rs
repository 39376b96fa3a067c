use crate::types::MirrorError;
use rsky_syntax::aturi::AtUri as SyntaxAtUri;
use rsky_syntax::did::ensure_valid_did;
use rsky_syntax::nsid::ensure_valid_nsid;
use rsky_syntax::record_key::ensure_valid_record_key;
use std::fmt;

/// Address of a single record: `at://{did}/{collection}/{rkey}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    did: String,
    collection: String,
    rkey: String,
}

impl AtUri {
    pub fn new(
        did: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Result<Self, MirrorError> {
        let uri = Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        };
        uri.validate()?;
        Ok(uri)
    }

    pub fn parse(s: &str) -> Result<Self, MirrorError> {
        let invalid = || MirrorError::InvalidUri(s.to_owned());
        if !s.starts_with("at://") {
            return Err(invalid());
        }
        let parsed = SyntaxAtUri::new(s.to_owned(), None).map_err(|_| invalid())?;
        // exactly `/{collection}/{rkey}`, with no query or fragment
        if parsed.pathname.matches('/').count() != 2
            || !parsed.hash.is_empty()
            || !parsed.search_params.is_empty()
        {
            return Err(invalid());
        }
        Self::new(
            parsed.host.clone(),
            parsed.get_collection(),
            parsed.get_rkey(),
        )
        .map_err(|_| invalid())
    }

    /// Builds a uri from a repo path (`collection/rkey`) as found in an MST.
    pub fn from_repo_path(did: &str, path: &str) -> Result<Self, MirrorError> {
        let (collection, rkey) = path
            .split_once('/')
            .ok_or_else(|| MirrorError::InvalidUri(format!("{did}/{path}")))?;
        Self::new(did, collection, rkey)
    }

    fn validate(&self) -> Result<(), MirrorError> {
        let invalid = |reason: String| MirrorError::InvalidUri(format!("{self}: {reason}"));
        ensure_valid_did(self.did.as_str()).map_err(|e| invalid(e.to_string()))?;
        ensure_valid_nsid(self.collection.as_str()).map_err(|e| invalid(e.to_string()))?;
        ensure_valid_record_key(self.rkey.as_str()).map_err(|e| invalid(e.to_string()))?;
        Ok(())
    }

    #[must_use]
    pub fn did(&self) -> &str {
        &self.did
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[must_use]
    pub fn rkey(&self) -> &str {
        &self.rkey
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}
