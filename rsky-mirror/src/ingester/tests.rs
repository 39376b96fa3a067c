use super::*;
use crate::db::MemoryDatabase;
use crate::scheduler::{MemoryScheduler, RESOLVE_DID_QUEUE};
use serde_json::json;

const CID: &str = "bafyreib2rxk3rybk3aobmv5cjuql3bm2twh4jo5uxgf5mg2mdplhx2cm3y";

fn commit_message(operation: &str, collection: &str, record: Option<serde_json::Value>) -> String {
    let mut commit = json!({
        "rev": "3lauicnwejh2f",
        "operation": operation,
        "collection": collection,
        "rkey": "3kabc",
    });
    if let Some(record) = record {
        commit["record"] = record;
        commit["cid"] = json!(CID);
    }
    json!({
        "did": "did:plc:alice",
        "time_us": 1_725_911_162_329_308_i64,
        "kind": "commit",
        "commit": commit,
    })
    .to_string()
}

#[test]
fn test_parse_create_commit() {
    let record = json!({"$type": "app.bsky.feed.like", "subject": {"uri": "at://did:plc:bob/app.bsky.feed.post/1", "cid": CID}, "createdAt": "2024-09-09T19:46:02.102Z"});
    let parsed = parse_message(&commit_message("create", "app.bsky.feed.like", Some(record.clone()))).unwrap();

    assert_eq!(parsed.time_us, 1_725_911_162_329_308);
    assert_eq!(
        parsed.result,
        ParseResult::Commit(CommitEvent {
            did: "did:plc:alice".to_owned(),
            operation: WriteAction::Create,
            collection: "app.bsky.feed.like".to_owned(),
            rkey: "3kabc".to_owned(),
            record: Some(record),
            cid: Some(CID.to_owned()),
        })
    );
}

#[test]
fn test_parse_delete_commit() {
    let parsed = parse_message(&commit_message("delete", "app.bsky.graph.follow", None)).unwrap();
    let ParseResult::Commit(event) = parsed.result else {
        panic!("expected a commit");
    };
    assert_eq!(event.operation, WriteAction::Delete);
    assert!(event.record.is_none());
    assert!(event.cid.is_none());
}

#[test]
fn test_unsupported_collection_is_filtered() {
    let parsed = parse_message(&commit_message(
        "create",
        "app.bsky.graph.block",
        Some(json!({"subject": "did:plc:bob", "createdAt": "2024-09-09T19:46:02.102Z"})),
    ))
    .unwrap();
    assert_eq!(parsed.result, ParseResult::Filtered);
}

#[test]
fn test_parse_identity() {
    let text = json!({
        "did": "did:plc:alice",
        "time_us": 1_725_516_665_333_808_i64,
        "kind": "identity",
        "identity": {"did": "did:plc:alice", "handle": "alice.test", "seq": 1_409_753_013, "time": "2024-09-05T06:11:04.870Z"}
    })
    .to_string();
    let parsed = parse_message(&text).unwrap();
    assert_eq!(
        parsed.result,
        ParseResult::Identity(IdentityEvent {
            did: "did:plc:alice".to_owned(),
            handle: Some("alice.test".to_owned()),
        })
    );

    let bare = json!({"did": "did:plc:alice", "time_us": 1, "kind": "identity", "identity": {"did": "did:plc:alice"}}).to_string();
    let ParseResult::Identity(event) = parse_message(&bare).unwrap().result else {
        panic!("expected an identity event");
    };
    assert!(event.handle.is_none());
}

#[test]
fn test_account_events_are_skipped() {
    let text = json!({
        "did": "did:plc:alice",
        "time_us": 1_725_516_665_333_808_i64,
        "kind": "account",
        "account": {"active": true, "did": "did:plc:alice", "seq": 1, "time": "2024-09-05T06:11:04.870Z"}
    })
    .to_string();
    assert_eq!(parse_message(&text).unwrap().result, ParseResult::Skip);
}

#[test]
fn test_malformed_message_is_an_error() {
    assert!(matches!(
        parse_message("{\"kind\": \"commit\"}"),
        Err(MirrorError::Serialization(_))
    ));
    assert!(parse_message("not json").is_err());
}

#[test]
fn test_subscribe_url() {
    let url = subscribe_url("jetstream2.us-east.bsky.network", Some(42)).unwrap();
    assert_eq!(url.scheme(), "wss");
    assert_eq!(url.host_str(), Some("jetstream2.us-east.bsky.network"));
    assert_eq!(url.path(), "/subscribe");

    let wanted: Vec<String> = url
        .query_pairs()
        .filter(|(k, _)| k == "wantedCollections")
        .map(|(_, v)| v.into_owned())
        .collect();
    let expected: Vec<String> = Collection::ALL.iter().map(|c| c.nsid().to_owned()).collect();
    assert_eq!(wanted, expected);
    assert!(url.query_pairs().any(|(k, v)| k == "cursor" && v == "42"));

    let local = subscribe_url("ws://localhost:6008/", None).unwrap();
    assert_eq!(local.scheme(), "ws");
    assert_eq!(local.port(), Some(6008));
    assert!(!local.query_pairs().any(|(k, _)| k == "cursor"));
}

#[tokio::test]
async fn test_handle_event_routes_to_indexing() {
    let db = MemoryDatabase::new();
    let scheduler = Arc::new(MemoryScheduler::new());
    let indexing = IndexingService::new(Arc::new(db.clone()), scheduler.clone(), None);

    let subscription = json!({"appviewDid": "did:web:mirror.example", "createdAt": "2024-09-09T19:46:02.102Z"});
    let parsed = parse_message(&commit_message(
        "create",
        "xyz.blacksky.mirror.subscription",
        Some(subscription),
    ))
    .unwrap();
    let outcome = handle_event(&indexing, parsed.result).await.unwrap();
    assert_eq!(outcome, Some(IndexOutcome::Indexed));
    assert_eq!(db.state().subscriptions.len(), 1);

    let identity = ParseResult::Identity(IdentityEvent {
        did: "did:plc:carol".to_owned(),
        handle: None,
    });
    assert_eq!(handle_event(&indexing, identity).await.unwrap(), None);
    assert!(db.state().actors.contains_key("did:plc:carol"));
    assert_eq!(scheduler.submitted_to(RESOLVE_DID_QUEUE).len(), 1);

    assert_eq!(handle_event(&indexing, ParseResult::Filtered).await.unwrap(), None);
}

fn subscription_event(did: &str, operation: WriteAction, rkey: &str) -> ParseResult {
    let (record, cid) = match operation {
        WriteAction::Delete => (None, None),
        _ => (
            Some(json!({"appviewDid": "did:web:mirror.example", "createdAt": "2024-09-09T19:46:02.102Z"})),
            Some(CID.to_owned()),
        ),
    };
    ParseResult::Commit(CommitEvent {
        did: did.to_owned(),
        operation,
        collection: "xyz.blacksky.mirror.subscription".to_owned(),
        rkey: rkey.to_owned(),
        record,
        cid,
    })
}

#[tokio::test]
async fn test_events_for_one_repo_apply_in_order() {
    let db = MemoryDatabase::new();
    let indexing = Arc::new(IndexingService::new(
        Arc::new(db.clone()),
        Arc::new(MemoryScheduler::new()),
        None,
    ));
    let dispatcher = ShardedDispatcher::new(indexing, 4);

    let mut time_us = 100;
    for round in 0..20 {
        let rkey = format!("3k{round}");
        for did in ["did:plc:alice", "did:plc:bob", "did:plc:carol"] {
            dispatcher
                .dispatch(time_us, subscription_event(did, WriteAction::Create, &rkey))
                .await;
            dispatcher
                .dispatch(time_us + 1, subscription_event(did, WriteAction::Delete, &rkey))
                .await;
            time_us += 2;
        }
    }
    dispatcher
        .dispatch(time_us, subscription_event("did:plc:alice", WriteAction::Create, "3klast"))
        .await;

    assert_eq!(dispatcher.drain().await, Some(time_us));
    let subscriptions = db.state().subscriptions;
    assert_eq!(subscriptions.len(), 1);
}

#[tokio::test]
async fn test_retryable_failure_is_retried_before_settling() {
    let db = MemoryDatabase::new();
    let indexing = Arc::new(IndexingService::new(
        Arc::new(db.clone()),
        Arc::new(MemoryScheduler::new()),
        None,
    ));
    db.fail_writes_to("subscription");
    let dispatcher = ShardedDispatcher::new(indexing, 2);

    dispatcher
        .dispatch(7, subscription_event("did:plc:alice", WriteAction::Create, "3kabc"))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // the failed event holds the cursor back
    assert_eq!(dispatcher.settled(), Some(6));
    db.clear_failures();

    assert_eq!(dispatcher.drain().await, Some(7));
    assert_eq!(db.state().subscriptions.len(), 1);
}

#[test]
fn test_cursor_tracker_waits_for_oldest_in_flight() {
    let tracker = CursorTracker::default();
    assert_eq!(tracker.settled(), None);

    tracker.begin(10);
    tracker.begin(11);
    tracker.observe(12);
    tracker.finish(11);
    assert_eq!(tracker.settled(), Some(9));

    tracker.begin(13);
    tracker.finish(10);
    assert_eq!(tracker.settled(), Some(12));

    tracker.finish(13);
    assert_eq!(tracker.settled(), Some(13));
}

#[test]
fn test_filtered_events_settle_immediately() {
    let tracker = CursorTracker::default();
    tracker.observe(5);
    tracker.observe(3);
    assert_eq!(tracker.settled(), Some(5));
}
