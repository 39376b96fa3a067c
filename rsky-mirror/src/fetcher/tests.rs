use crate::fetcher::{RecordFetcher, RepoFetcher};
use crate::identity::ResolvedIdentity;
use crate::identity::tests::StaticResolver;
use crate::lexicon::Collection;
use crate::repo::fixtures::{build_repo, k256_did_key, k256_signing_key};
use crate::types::{MirrorError, RecordFetchError, VerificationError};
use crate::uri::AtUri;
use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DID: &str = "did:plc:author";
const CID: &str = "bafyreib2rxk3rybk3aobmv5cjuql3bm2twh4jo5uxgf5mg2mdplhx2cm3y";

fn resolver(pds: &str, signing_key: String) -> Arc<StaticResolver> {
    Arc::new(StaticResolver::new(vec![ResolvedIdentity {
        did: DID.to_owned(),
        handle: Some("author.test".to_owned()),
        signing_key,
        pds: pds.to_owned(),
    }]))
}

fn record_fetcher(server: &mockito::Server) -> RecordFetcher {
    let key = k256_did_key(&k256_signing_key(1));
    RecordFetcher::new(resolver(&server.url(), key), Duration::from_secs(5)).unwrap()
}

fn post_uri() -> AtUri {
    AtUri::new(DID, Collection::Post.nsid(), "3kpost").unwrap()
}

fn get_record_query() -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("repo".into(), DID.into()),
        Matcher::UrlEncoded("collection".into(), "app.bsky.feed.post".into()),
        Matcher::UrlEncoded("rkey".into(), "3kpost".into()),
    ])
}

#[tokio::test]
async fn test_fetch_record() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/xrpc/com.atproto.repo.getRecord")
        .match_query(get_record_query())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "uri": post_uri().to_string(),
                "cid": CID,
                "value": {"$type": "app.bsky.feed.post", "text": "hi", "createdAt": "2024-05-01T00:00:00.000Z"}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let record = record_fetcher(&server).fetch(&post_uri()).await.unwrap();
    mock.assert_async().await;
    assert_eq!(record.cid(), CID);
    assert_eq!(record.collection(), Collection::Post);
    assert_eq!(record.author(), DID);
}

#[tokio::test]
async fn test_missing_record_is_not_found() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/xrpc/com.atproto.repo.getRecord")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(r#"{"error":"RecordNotFound","message":"Could not locate record"}"#)
        .create_async()
        .await;

    let err = record_fetcher(&server).fetch(&post_uri()).await.unwrap_err();
    assert!(matches!(
        err,
        MirrorError::RecordFetch(RecordFetchError::NotFound(_))
    ));
    assert!(err.is_skippable());
}

#[tokio::test]
async fn test_server_error_is_unreachable() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/xrpc/com.atproto.repo.getRecord")
        .match_query(Matcher::Any)
        .with_status(502)
        .create_async()
        .await;

    let err = record_fetcher(&server).fetch(&post_uri()).await.unwrap_err();
    assert!(matches!(
        err,
        MirrorError::RecordFetch(RecordFetchError::Unreachable { .. })
    ));
    assert!(err.is_skippable());
}

#[tokio::test]
async fn test_invalid_record_is_skippable() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/xrpc/com.atproto.repo.getRecord")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"uri": post_uri().to_string(), "cid": CID, "value": {"text": 7}}).to_string())
        .create_async()
        .await;

    let err = record_fetcher(&server).fetch(&post_uri()).await.unwrap_err();
    assert!(matches!(
        err,
        MirrorError::RecordFetch(RecordFetchError::Invalid { .. })
    ));
    assert!(err.is_skippable());
}

#[tokio::test]
async fn test_unresolvable_author_is_retryable() {
    let server = mockito::Server::new_async().await;
    let uri = AtUri::new("did:plc:unknown", Collection::Post.nsid(), "3kpost").unwrap();
    let err = record_fetcher(&server).fetch(&uri).await.unwrap_err();
    assert!(matches!(err, MirrorError::DidResolution(_)));
    assert!(!err.is_skippable());
}

fn repo_records() -> Vec<(String, serde_json::Value)> {
    vec![
        (
            "app.bsky.actor.profile/self".to_owned(),
            json!({"$type": "app.bsky.actor.profile", "displayName": "Author"}),
        ),
        (
            "app.bsky.feed.post/3kpost".to_owned(),
            json!({"$type": "app.bsky.feed.post", "text": "hi", "createdAt": "2024-05-01T00:00:00.000Z"}),
        ),
        (
            "app.bsky.feed.post/3kbroken".to_owned(),
            json!({"$type": "app.bsky.feed.post", "createdAt": "2024-05-01T00:00:00.000Z"}),
        ),
        (
            "app.bsky.graph.block/3kblock".to_owned(),
            json!({"$type": "app.bsky.graph.block", "subject": "did:plc:x", "createdAt": "2024-05-01T00:00:00.000Z"}),
        ),
    ]
}

#[tokio::test]
async fn test_fetch_verified_repo() {
    let signer = k256_signing_key(7);
    let car = build_repo(DID, &signer, &repo_records()).to_car().await;

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/xrpc/com.atproto.sync.getRepo")
        .match_query(Matcher::UrlEncoded("did".into(), DID.into()))
        .with_status(200)
        .with_header("content-type", "application/vnd.ipld.car")
        .with_body(car)
        .create_async()
        .await;

    let fetcher = RepoFetcher::new(
        resolver(&server.url(), k256_did_key(&signer)),
        Duration::from_secs(5),
    )
    .unwrap();
    let repo = fetcher.fetch(DID).await.unwrap();
    mock.assert_async().await;

    // the block is outside the supported set, the broken post fails validation
    let mut uris: Vec<String> = repo.records.iter().map(|r| r.uri().to_string()).collect();
    uris.sort();
    assert_eq!(
        uris,
        vec![
            format!("at://{DID}/app.bsky.actor.profile/self"),
            format!("at://{DID}/app.bsky.feed.post/3kpost"),
        ]
    );
    assert_eq!(repo.rev, "3lauicnwejh2f");
    assert_eq!(repo.identity.did, DID);
}

#[tokio::test]
async fn test_repo_signed_by_other_key_is_rejected() {
    let forger = k256_signing_key(8);
    let car = build_repo(DID, &forger, &repo_records()).to_car().await;

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/xrpc/com.atproto.sync.getRepo")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(car)
        .create_async()
        .await;

    let fetcher = RepoFetcher::new(
        resolver(&server.url(), k256_did_key(&k256_signing_key(7))),
        Duration::from_secs(5),
    )
    .unwrap();
    let err = fetcher.fetch(DID).await.unwrap_err();
    assert!(matches!(
        err,
        MirrorError::Verification(VerificationError::BadSignature)
    ));
    assert!(!err.is_skippable());
}

#[tokio::test]
async fn test_repo_http_failure_is_retryable() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/xrpc/com.atproto.sync.getRepo")
        .match_query(Matcher::Any)
        .with_status(500)
        .create_async()
        .await;

    let fetcher = RepoFetcher::new(
        resolver(&server.url(), k256_did_key(&k256_signing_key(7))),
        Duration::from_secs(5),
    )
    .unwrap();
    let err = fetcher.fetch(DID).await.unwrap_err();
    assert!(matches!(err, MirrorError::Repo(_)));
    assert!(!err.is_skippable());
}

#[tokio::test]
async fn test_oversized_repo_refused() {
    let signer = k256_signing_key(7);
    let car = build_repo(DID, &signer, &repo_records()).to_car().await;
    let limit = car.len() - 1;

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/xrpc/com.atproto.sync.getRepo")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(car)
        .create_async()
        .await;

    let fetcher = RepoFetcher::new(
        resolver(&server.url(), k256_did_key(&signer)),
        Duration::from_secs(5),
    )
    .unwrap()
    .with_max_bytes(limit);
    let err = fetcher.fetch(DID).await.unwrap_err();
    assert!(matches!(err, MirrorError::Repo(_)));
}

#[tokio::test]
async fn test_unusable_signing_key_fails_before_download() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/xrpc/com.atproto.sync.getRepo")
        .match_query(Matcher::Any)
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let fetcher = RepoFetcher::new(
        resolver(&server.url(), "did:key:zNotAKey".to_owned()),
        Duration::from_secs(5),
    )
    .unwrap();
    let err = fetcher.fetch(DID).await.unwrap_err();
    assert!(matches!(
        err,
        MirrorError::Verification(VerificationError::InvalidKey(_))
    ));
    mock.assert_async().await;
}
