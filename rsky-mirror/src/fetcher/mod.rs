//! Remote reads: one record at a time, or a whole verified repository.

pub mod record;
pub mod repo;

#[cfg(test)]
mod tests;

pub use record::RecordFetcher;
pub use repo::{FetchedRepo, RepoFetcher};
