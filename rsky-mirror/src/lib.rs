pub mod backfill;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod http;
pub mod identity;
pub mod indexing;
pub mod ingester;
pub mod lexicon;
pub mod metrics;
pub mod queue;
pub mod record;
pub mod repo;
pub mod scheduler;
pub mod types;
pub mod uri;
pub mod workers;

use std::sync::atomic::AtomicBool;

pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);
