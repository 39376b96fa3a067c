use crate::identity::{DidCache, DidResolver, IdResolver, IdentityResolver, ResolvedIdentity};
use crate::repo::fixtures::{k256_did_key, k256_signing_key};
use crate::types::{DidResolutionError, IdentityError};
use async_trait::async_trait;
use mockito::Matcher;
use std::collections::HashMap;
use std::time::Duration;

/// Resolver backed by a fixed table, for tests that should not touch the network.
pub(crate) struct StaticResolver {
    pub identities: HashMap<String, ResolvedIdentity>,
}

impl StaticResolver {
    pub(crate) fn new(identities: Vec<ResolvedIdentity>) -> Self {
        Self {
            identities: identities.into_iter().map(|i| (i.did.clone(), i)).collect(),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticResolver {
    async fn resolve(&self, did: &str) -> Result<ResolvedIdentity, DidResolutionError> {
        self.identities
            .get(did)
            .cloned()
            .ok_or_else(|| DidResolutionError::new(did, IdentityError::DidNotFound))
    }
}

pub(crate) fn did_doc_json(did: &str, handle: &str, did_key: &str, pds: &str) -> String {
    serde_json::json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": did,
        "alsoKnownAs": [format!("at://{handle}")],
        "verificationMethod": [{
            "id": format!("{did}#atproto"),
            "type": "Multikey",
            "controller": did,
            "publicKeyMultibase": did_key.trim_start_matches("did:key:")
        }],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": pds
        }]
    })
    .to_string()
}

/// PLC lookups percent-encode the DID in the path.
fn plc_path(did: &str) -> Matcher {
    Matcher::Regex(format!("^/{}$", did.replace(':', "(:|%3A)")))
}

fn resolver_for(server: &mockito::Server, stale: Duration, max: Duration) -> IdResolver {
    IdResolver::new(server.url(), Duration::from_secs(3), stale, max)
}

#[tokio::test]
async fn test_resolve_plc_and_cache_hit() {
    let mut server = mockito::Server::new_async().await;
    let did_key = k256_did_key(&k256_signing_key(21));
    let mock = server
        .mock("GET", plc_path("did:plc:alice"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(did_doc_json(
            "did:plc:alice",
            "alice.test",
            &did_key,
            "https://pds.example.com",
        ))
        .expect(1)
        .create_async()
        .await;

    let resolver = resolver_for(&server, Duration::from_secs(60), Duration::from_secs(600));
    let first = resolver.resolve("did:plc:alice").await.unwrap();
    assert_eq!(first.handle.as_deref(), Some("alice.test"));
    assert_eq!(first.signing_key, did_key);
    assert_eq!(first.pds, "https://pds.example.com");

    let second = resolver.resolve("did:plc:alice").await.unwrap();
    assert_eq!(first, second);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_resolve_not_found() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", plc_path("did:plc:ghost"))
        .with_status(404)
        .create_async()
        .await;

    let resolver = resolver_for(&server, Duration::from_secs(60), Duration::from_secs(600));
    let err = resolver.resolve("did:plc:ghost").await.unwrap_err();
    assert_eq!(err.did, "did:plc:ghost");
    assert!(matches!(err.source, IdentityError::DidNotFound));
}

#[tokio::test]
async fn test_resolve_rejects_document_without_pds() {
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({"id": "did:plc:nopds", "alsoKnownAs": ["at://x.test"]});
    let _mock = server
        .mock("GET", plc_path("did:plc:nopds"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await;

    let resolver = resolver_for(&server, Duration::from_secs(60), Duration::from_secs(600));
    let err = resolver.resolve("did:plc:nopds").await.unwrap_err();
    assert!(matches!(
        err.source,
        IdentityError::PoorlyFormattedDidDocument(_)
    ));
}

#[tokio::test]
async fn test_stale_entry_served_and_refreshed() {
    let mut server = mockito::Server::new_async().await;
    let did_key = k256_did_key(&k256_signing_key(22));
    let mock = server
        .mock("GET", plc_path("did:plc:bob"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(did_doc_json(
            "did:plc:bob",
            "bob.test",
            &did_key,
            "https://pds.example.com",
        ))
        .expect(2)
        .create_async()
        .await;

    // everything is immediately stale but never expires
    let resolver = resolver_for(&server, Duration::ZERO, Duration::from_secs(600));
    resolver.resolve("did:plc:bob").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let cached = resolver.resolve("did:plc:bob").await.unwrap();
    assert_eq!(cached.handle.as_deref(), Some("bob.test"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    mock.assert_async().await;
}

#[test]
fn test_cache_expiry_evicts() {
    let cache = DidCache::new(Duration::ZERO, Duration::ZERO);
    cache.cache_did(ResolvedIdentity {
        did: "did:plc:carol".to_owned(),
        handle: None,
        signing_key: "did:key:z".to_owned(),
        pds: "https://pds.example.com".to_owned(),
    });
    std::thread::sleep(Duration::from_millis(2));
    assert!(cache.check_cache("did:plc:carol").is_none());
    assert!(cache.is_empty());
}

#[test]
fn test_cache_fresh_entry_not_stale() {
    let cache = DidCache::new(Duration::from_secs(60), Duration::from_secs(600));
    cache.cache_did(ResolvedIdentity {
        did: "did:plc:dave".to_owned(),
        handle: Some("dave.test".to_owned()),
        signing_key: "did:key:z".to_owned(),
        pds: "https://pds.example.com".to_owned(),
    });
    let hit = cache.check_cache("did:plc:dave").unwrap();
    assert!(!hit.stale);
    assert_eq!(hit.identity.handle.as_deref(), Some("dave.test"));
}

#[tokio::test]
async fn test_stale_reads_share_one_refresh() {
    let mut server = mockito::Server::new_async().await;
    let did_key = k256_did_key(&k256_signing_key(23));
    let mock = server
        .mock("GET", plc_path("did:plc:erin"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(did_doc_json(
            "did:plc:erin",
            "erin.test",
            &did_key,
            "https://pds.example.com",
        ))
        .expect(2)
        .create_async()
        .await;

    let resolver = resolver_for(&server, Duration::ZERO, Duration::from_secs(600));
    resolver.resolve("did:plc:erin").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    // cache hits never yield, so every read lands before the refresh runs
    for _ in 0..5 {
        let cached = resolver.resolve("did:plc:erin").await.unwrap();
        assert_eq!(cached.handle.as_deref(), Some("erin.test"));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    mock.assert_async().await;
}

#[tokio::test]
async fn test_malformed_did_rejected_before_lookup() {
    let resolver = DidResolver::new("http://127.0.0.1:1", Duration::from_secs(1));
    for did in ["did", "did:plc", "did::abc", "alice.test"] {
        assert!(matches!(
            resolver.resolve_no_cache(did).await,
            Err(IdentityError::PoorlyFormattedDid)
        ));
    }
    assert!(matches!(
        resolver.resolve_no_cache("did:key:zQ3sh").await,
        Err(IdentityError::UnsupportedDidMethod)
    ));
}
