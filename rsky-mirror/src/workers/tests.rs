use super::*;
use crate::db::{MemoryDatabase, PostStat};
use crate::fetcher::RecordFetcher;
use crate::identity::ResolvedIdentity;
use crate::identity::tests::StaticResolver;
use crate::indexing::{IndexContext, IndexingService};
use crate::lexicon::Collection;
use crate::queue::{JobRequest, QueueOptions, QueueStore};
use crate::record::Record;
use crate::repo::fixtures::{k256_did_key, k256_signing_key};
use crate::scheduler::{self, FETCH_RECORD_QUEUE, FetchRecordJob, MemoryScheduler, PostStatsJob};
use crate::uri::AtUri;
use serde_json::json;
use tempfile::TempDir;

const AUTHOR: &str = "did:plc:author";
const CID: &str = "bafyreib2rxk3rybk3aobmv5cjuql3bm2twh4jo5uxgf5mg2mdplhx2cm3y";
const CREATED: &str = "2024-05-01T00:00:00.000Z";

struct Harness {
    db: MemoryDatabase,
    scheduler: Arc<MemoryScheduler>,
    indexing: Arc<IndexingService>,
    resolver: Arc<StaticResolver>,
    store: QueueStore,
    _dir: TempDir,
}

fn harness(pds: &str) -> Harness {
    let db = MemoryDatabase::new();
    let scheduler = Arc::new(MemoryScheduler::new());
    let indexing = Arc::new(IndexingService::new(
        Arc::new(db.clone()),
        scheduler.clone(),
        None,
    ));
    let resolver = Arc::new(StaticResolver::new(vec![ResolvedIdentity {
        did: AUTHOR.to_owned(),
        handle: Some("author.test".to_owned()),
        signing_key: k256_did_key(&k256_signing_key(1)),
        pds: pds.to_owned(),
    }]));
    let dir = TempDir::with_prefix("mirror_workers_test_").unwrap();
    let store = QueueStore::open(dir.path().join("queue_db")).unwrap();
    Harness {
        db,
        scheduler,
        indexing,
        resolver,
        store,
        _dir: dir,
    }
}

impl Harness {
    fn queue(&self, name: &str, max_attempts: u32) -> JobQueue {
        self.store
            .queue(
                name,
                QueueOptions {
                    max_attempts,
                    backoff_base: Duration::from_millis(1),
                    merge: None,
                },
            )
            .unwrap()
    }

    fn fetch_handler(&self) -> FetchRecordHandler {
        let fetcher =
            RecordFetcher::new(self.resolver.clone(), Duration::from_secs(5)).unwrap();
        FetchRecordHandler::new(self.indexing.clone(), Arc::new(fetcher))
    }
}

fn enqueue(queue: &JobQueue, request: JobRequest) -> Job {
    queue
        .add(&request.job_name, request.data, &request.options)
        .unwrap();
    queue.next_ready().unwrap().unwrap()
}

fn repost_uri() -> String {
    format!("at://{AUTHOR}/app.bsky.feed.repost/3krepost")
}

#[tokio::test]
async fn test_fetch_at_max_depth_makes_no_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/xrpc/com.atproto.repo.getRecord")
        .match_query(mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let h = harness(&server.url());
    let queue = h.queue(FETCH_RECORD_QUEUE, 3);

    let job = enqueue(&queue, scheduler::fetch_record_request(&repost_uri(), 2, false).unwrap());
    let id = job.id.clone();
    let result = process(&queue, &h.fetch_handler(), job).await;

    assert_eq!(result, JobResult::Completed);
    mock.assert_async().await;
    let logs = queue.logs(&id).unwrap();
    assert!(logs.iter().any(|l| l.contains("is at depth 2, not fetching")));
    assert_eq!(queue.counts().unwrap(), crate::queue::QueueCounts::default());
}

#[tokio::test]
async fn test_fetch_of_unsupported_collection_makes_no_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/xrpc/com.atproto.repo.getRecord")
        .match_query(mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let h = harness(&server.url());
    let queue = h.queue(FETCH_RECORD_QUEUE, 3);
    let list = format!("at://{AUTHOR}/app.bsky.graph.list/3klist");

    let job = enqueue(&queue, scheduler::fetch_record_request(&list, 1, true).unwrap());
    let id = job.id.clone();
    let result = process(&queue, &h.fetch_handler(), job).await;

    assert_eq!(result, JobResult::Completed);
    mock.assert_async().await;
    let logs = queue.logs(&id).unwrap();
    assert!(logs.iter().any(|l| l.contains("not in a supported collection")));
    assert!(h.scheduler.submitted_to(FETCH_RECORD_QUEUE).is_empty());
    assert_eq!(queue.counts().unwrap().failed, 0);
}

#[tokio::test]
async fn test_malformed_uri_is_skipped_not_retried() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url());
    let queue = h.queue(FETCH_RECORD_QUEUE, 3);

    let job = enqueue(
        &queue,
        scheduler::fetch_record_request("at://did:plc:author/not an nsid/3k", 0, true).unwrap(),
    );
    let id = job.id.clone();
    let result = process(&queue, &h.fetch_handler(), job).await;

    assert!(matches!(result, JobResult::Skipped(_)));
    assert!(queue.get(&id).unwrap().is_none());
    assert_eq!(queue.counts().unwrap(), crate::queue::QueueCounts::default());
}

#[tokio::test]
async fn test_fetch_below_max_depth_indexes_and_goes_deeper() {
    let mut server = mockito::Server::new_async().await;
    let subject = format!("at://{AUTHOR}/app.bsky.feed.post/3kpost");
    let mock = server
        .mock("GET", "/xrpc/com.atproto.repo.getRecord")
        .match_query(mockito::Matcher::UrlEncoded("rkey".into(), "3krepost".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "uri": repost_uri(),
                "cid": CID,
                "value": {
                    "$type": "app.bsky.feed.repost",
                    "subject": {"uri": subject, "cid": CID},
                    "createdAt": CREATED
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    let h = harness(&server.url());
    let queue = h.queue(FETCH_RECORD_QUEUE, 3);

    let job = enqueue(&queue, scheduler::fetch_record_request(&repost_uri(), 1, true).unwrap());
    let result = process(&queue, &h.fetch_handler(), job).await;
    assert_eq!(result, JobResult::Completed);
    mock.assert_async().await;

    // fetched records are forced past the policy, the author is untracked
    assert!(h.db.state().reposts.contains_key(&repost_uri()));

    let next: Vec<FetchRecordJob> = h
        .scheduler
        .submitted_to(FETCH_RECORD_QUEUE)
        .into_iter()
        .map(|r| serde_json::from_value(r.data).unwrap())
        .collect();
    assert_eq!(
        next,
        vec![FetchRecordJob {
            uri: subject,
            depth: 2,
            live: false
        }]
    );
}

#[tokio::test]
async fn test_missing_record_is_skipped_and_completed() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/xrpc/com.atproto.repo.getRecord")
        .match_query(mockito::Matcher::Any)
        .with_status(400)
        .with_body(r#"{"error":"RecordNotFound"}"#)
        .create_async()
        .await;
    let h = harness(&server.url());
    let queue = h.queue(FETCH_RECORD_QUEUE, 3);

    let job = enqueue(&queue, scheduler::fetch_record_request(&repost_uri(), 0, true).unwrap());
    let id = job.id.clone();
    let result = process(&queue, &h.fetch_handler(), job).await;

    assert!(matches!(result, JobResult::Skipped(_)));
    assert!(queue.get(&id).unwrap().is_none());
    assert_eq!(queue.counts().unwrap().failed, 0);
    let logs = queue.logs(&id).unwrap();
    assert!(logs.iter().any(|l| l.starts_with("skipped:")));
}

#[tokio::test]
async fn test_resolution_failure_retries_then_dead_letters() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url());
    let queue = h.queue(FETCH_RECORD_QUEUE, 2);
    let uri = "at://did:plc:nobody/app.bsky.feed.post/3kpost";

    let job = enqueue(&queue, scheduler::fetch_record_request(uri, 0, true).unwrap());
    assert_eq!(
        process(&queue, &h.fetch_handler(), job).await,
        JobResult::Retrying
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = queue.next_ready().unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(
        process(&queue, &h.fetch_handler(), job).await,
        JobResult::DeadLettered
    );
    assert_eq!(queue.failed().unwrap().len(), 1);
}

#[tokio::test]
async fn test_resolve_did_stores_handle() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url());
    let queue = h.queue(scheduler::RESOLVE_DID_QUEUE, 3);
    let handler = ResolveDidHandler::new(h.resolver.clone(), h.indexing.db().clone());

    let job = enqueue(&queue, scheduler::resolve_did_request(AUTHOR));
    assert_eq!(process(&queue, &handler, job).await, JobResult::Completed);

    let actor = h.db.state().actors.get(AUTHOR).cloned().unwrap();
    assert_eq!(actor.handle.as_deref(), Some("author.test"));
}

#[tokio::test]
async fn test_post_stats_recount() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url());
    let subject = format!("at://{AUTHOR}/app.bsky.feed.post/3kpost");
    for liker in ["did:plc:a", "did:plc:b"] {
        let like = Record::new(
            AtUri::new(liker, Collection::Like.nsid(), "3klike").unwrap(),
            CID,
            json!({"subject": {"uri": subject, "cid": CID}, "createdAt": CREATED}),
        )
        .unwrap();
        h.indexing
            .index_record(&like, IndexContext::backfill())
            .await
            .unwrap();
    }

    let queue = h.queue(scheduler::AGGREGATE_POST_STATS_QUEUE, 3);
    let handler = PostStatsHandler::new(h.indexing.db().clone());
    let request = scheduler::post_stats_request(&subject, PostStat::Like).unwrap();
    let data: PostStatsJob = serde_json::from_value(request.data.clone()).unwrap();
    assert_eq!(data.stat, PostStat::Like);

    // debounced jobs start delayed; run the job directly
    queue
        .add(
            &request.job_name,
            request.data,
            &crate::queue::JobOptions {
                delay: None,
                ..request.options
            },
        )
        .unwrap();
    let job = queue.next_ready().unwrap().unwrap();
    assert_eq!(process(&queue, &handler, job).await, JobResult::Completed);
    assert_eq!(h.db.state().post_agg.get(&subject).unwrap().like_count, 2);
}

#[tokio::test]
async fn test_worker_drains_queue() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url());
    let queue = h.queue(scheduler::RESOLVE_DID_QUEUE, 3);
    let handler = Arc::new(ResolveDidHandler::new(
        h.resolver.clone(),
        h.indexing.db().clone(),
    ));

    let worker = Worker::new(queue.clone(), handler, 2).spawn();
    let request = scheduler::resolve_did_request(AUTHOR);
    queue
        .add(&request.job_name, request.data, &request.options)
        .unwrap();

    let mut drained = false;
    for _ in 0..100 {
        if queue.counts().unwrap() == crate::queue::QueueCounts::default()
            && h.db.state().actors.contains_key(AUTHOR)
        {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.abort();
    assert!(drained);
}
