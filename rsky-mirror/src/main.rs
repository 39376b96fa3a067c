use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use mimalloc::MiMalloc;
use signal_hook::consts::{SIGINT, TERM_SIGNALS};
use signal_hook::flag;
use signal_hook::iterator::SignalsInfo;
use signal_hook::iterator::exfiltrator::WithOrigin;
use tracing_subscriber::EnvFilter;

use rsky_mirror::SHUTDOWN;
use rsky_mirror::backfill::BackfillOrchestrator;
use rsky_mirror::config::{
    AGGREGATE_STATS_CONCURRENCY, BACKFILL_CONCURRENCY, DB_POOL_SIZE, DEFAULT_PLC_URL,
    DID_CACHE_MAX_TTL, DID_CACHE_STALE_TTL, FETCH_RECORD_CONCURRENCY, IDENTITY_RESOLVER_TIMEOUT,
    RECORD_FETCH_TIMEOUT, REPO_FETCH_TIMEOUT, RESOLVE_DID_CONCURRENCY,
};
use rsky_mirror::db::{Database, PgDatabase};
use rsky_mirror::fetcher::{RecordFetcher, RepoFetcher};
use rsky_mirror::identity::{IdResolver, IdentityResolver};
use rsky_mirror::indexing::IndexingService;
use rsky_mirror::ingester::Ingester;
use rsky_mirror::metrics;
use rsky_mirror::queue::QueueStore;
use rsky_mirror::scheduler::{QueueScheduler, Queues};
use rsky_mirror::workers::{
    ActorStatsHandler, BackfillHandler, FetchRecordHandler, PostStatsHandler, ResolveDidHandler,
    Worker,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, clap::Parser)]
pub struct Args {
    #[clap(long, env = "DATABASE_URL")]
    database_url: String,

    #[clap(long, env = "JETSTREAM_HOSTS", value_delimiter = ',')]
    jetstream_hosts: Vec<String>,

    /// Only subscriptions naming this DID trigger a backfill. Unset accepts all.
    #[clap(long, env = "SERVICE_DID")]
    service_did: Option<String>,

    #[clap(long, env = "PLC_URL", default_value = DEFAULT_PLC_URL)]
    plc_url: String,

    #[clap(long, env = "QUEUE_DB_PATH", default_value = "mirror_queue")]
    queue_db_path: PathBuf,

    #[clap(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    color_eyre::install()?;

    rsky_mirror::http::install_crypto_provider();

    let args = Args::parse();
    let jetstream_hosts: Vec<String> = args
        .jetstream_hosts
        .iter()
        .filter(|h| !h.is_empty())
        .cloned()
        .collect();
    if jetstream_hosts.is_empty() {
        return Err(color_eyre::eyre::eyre!("no jetstream hosts specified"));
    }

    tracing::info!("starting mirror");
    tracing::info!("jetstream hosts: {jetstream_hosts:?}");
    tracing::info!("service did: {:?}", args.service_did);
    tracing::info!("plc: {}", args.plc_url);
    tracing::info!("queue db: {}", args.queue_db_path.display());
    tracing::info!("metrics port: {}", args.metrics_port);

    metrics::initialize_metrics();

    let terminate_now = Arc::new(std::sync::atomic::AtomicBool::new(false));
    flag::register_conditional_shutdown(SIGINT, 1, Arc::clone(&terminate_now))?;
    flag::register(SIGINT, Arc::clone(&terminate_now))?;

    let metrics_port = args.metrics_port;

    thread::scope(move |s| {
        let handles = vec![
            thread::Builder::new()
                .name("mirror-service".into())
                .spawn_scoped(s, move || run_service(args, jetstream_hosts))?,
            thread::Builder::new()
                .name("mirror-metrics".into())
                .spawn_scoped(s, move || start_metrics_server(metrics_port))?,
        ];

        let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)
            .map_err(|e| color_eyre::eyre::eyre!("failed to init signals: {e}"))?;

        'outer: loop {
            for signal_info in signals.pending() {
                if TERM_SIGNALS.contains(&signal_info.signal) {
                    break 'outer;
                }
            }
            for handle in &handles {
                if handle.is_finished() {
                    break 'outer;
                }
            }
            thread::sleep(SLEEP);
        }

        tracing::info!("shutting down");
        SHUTDOWN.store(true, Ordering::Relaxed);

        for handle in handles {
            if let Ok(res) = handle.join() {
                res?;
            }
        }

        Ok(())
    })
}

/// Storage, queues, workers and the ingester on one multi-threaded runtime.
fn run_service(args: Args, jetstream_hosts: Vec<String>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| color_eyre::eyre::eyre!("failed to create runtime: {e}"))?;

    rt.block_on(async move {
        let pg = PgDatabase::new(args.database_url, *DB_POOL_SIZE)?;
        pg.migrate().await?;
        let db: Arc<dyn Database> = Arc::new(pg);

        let store = QueueStore::open(&args.queue_db_path)?;
        let queues = Queues::open(&store)?;
        let scheduler = Arc::new(QueueScheduler::new(queues.clone()));

        let resolver: Arc<dyn IdentityResolver> = Arc::new(IdResolver::new(
            args.plc_url,
            IDENTITY_RESOLVER_TIMEOUT,
            *DID_CACHE_STALE_TTL,
            *DID_CACHE_MAX_TTL,
        ));
        let indexing = Arc::new(IndexingService::new(
            Arc::clone(&db),
            scheduler,
            args.service_did,
        ));
        let records = Arc::new(RecordFetcher::new(
            Arc::clone(&resolver),
            *RECORD_FETCH_TIMEOUT,
        )?);
        let repos = Arc::new(RepoFetcher::new(Arc::clone(&resolver), *REPO_FETCH_TIMEOUT)?);
        let orchestrator = Arc::new(BackfillOrchestrator::new(Arc::clone(&indexing), repos));

        let workers = vec![
            Worker::new(
                queues.fetch_record.clone(),
                Arc::new(FetchRecordHandler::new(Arc::clone(&indexing), records)),
                *FETCH_RECORD_CONCURRENCY,
            )
            .spawn(),
            Worker::new(
                queues.resolve_did.clone(),
                Arc::new(ResolveDidHandler::new(resolver, Arc::clone(&db))),
                *RESOLVE_DID_CONCURRENCY,
            )
            .spawn(),
            Worker::new(
                queues.backfill.clone(),
                Arc::new(BackfillHandler::new(orchestrator)),
                *BACKFILL_CONCURRENCY,
            )
            .spawn(),
            Worker::new(
                queues.aggregate_post_stats.clone(),
                Arc::new(PostStatsHandler::new(Arc::clone(&db))),
                *AGGREGATE_STATS_CONCURRENCY,
            )
            .spawn(),
            Worker::new(
                queues.aggregate_actor_stats.clone(),
                Arc::new(ActorStatsHandler::new(db)),
                *AGGREGATE_STATS_CONCURRENCY,
            )
            .spawn(),
        ];

        Ingester::new(jetstream_hosts, indexing, store).run().await;

        for worker in workers {
            drop(worker.await);
        }
        Ok::<_, color_eyre::eyre::Error>(())
    })
}

fn start_metrics_server(port: u16) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| color_eyre::eyre::eyre!("failed to create tokio runtime: {e}"))?;

    rt.block_on(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| color_eyre::eyre::eyre!("failed to bind metrics server on {addr}: {e}"))?;

        tracing::info!("metrics server listening on http://{addr}/metrics");

        loop {
            if SHUTDOWN.load(Ordering::Relaxed) {
                break;
            }

            // wake up now and then to notice shutdown
            let accepted =
                tokio::time::timeout(Duration::from_millis(500), listener.accept()).await;
            let (stream, _) = match accepted {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    tracing::error!("failed to accept connection: {e}");
                    continue;
                }
                Err(_) => continue,
            };

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                    let (status, body) = if req.uri().path() == "/metrics" {
                        match metrics::encode_metrics() {
                            Ok(body) => (200u16, body),
                            Err(e) => (500, format!("Error encoding metrics: {e}")),
                        }
                    } else {
                        (404, "Not Found".to_owned())
                    };
                    Response::builder()
                        .status(status)
                        .header("Content-Type", "text/plain; version=0.0.4")
                        .body(Full::new(Bytes::from(body)))
                        .map_err(|e| color_eyre::eyre::eyre!("failed to build response: {e}"))
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::error!("error serving connection: {e}");
                }
            });
        }

        Ok::<_, color_eyre::eyre::Error>(())
    })
}
