//! Storage abstraction for chunk records.
//!
//! The [`VectorStore`] trait defines every storage operation the ingestion
//! pipeline and the retrieval engine need, enabling pluggable backends
//! (SQLite in the root crate, in-memory here for tests).
//!
//! Errors are a closed sum ([`StoreError`]) so the queue can classify a
//! failure without inspecting message text; backends map their driver's
//! status codes onto this set exactly once.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::{Candidate, ChunkRecord, MetadataFilter, ScanFilter};

/// Failure modes of a store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-key conflict the backend could not resolve as an upsert.
    /// The queue treats this as "chunks already present".
    #[error("conflict: {0}")]
    Conflict(String),
    /// The store is temporarily unreachable or busy.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// An operation exceeded its deadline.
    #[error("store operation timed out: {0}")]
    Timeout(String),
    /// No connection could be checked out of the pool in time.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
    /// Schema violation, corruption, or a bug surfacing from the driver.
    #[error("store internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the ingestion queue should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::PoolExhausted(_)
        )
    }
}

/// Result of one batch upsert.
///
/// `replaced` counts chunks whose `chunk_id` already existed; a batch that
/// replaced everything and inserted nothing is a duplicate re-ingest.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub replaced: usize,
}

impl BatchOutcome {
    pub fn is_all_duplicates(&self) -> bool {
        self.inserted == 0 && self.replaced > 0
    }
}

/// Store-level counters for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub chunk_count: u64,
    pub pool_size: u32,
    pub pool_checked_out: u32,
    pub pool_overflow: u32,
}

/// Abstract storage backend for chunk records.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_batch`](VectorStore::upsert_batch) | Commit all chunks of one resource atomically, idempotent by `chunk_id` |
/// | [`dense_search`](VectorStore::dense_search) | Cosine-ranked nearest neighbors of a query vector |
/// | [`sparse_search`](VectorStore::sparse_search) | BM25-ranked full-text candidates |
/// | [`filtered_scan`](VectorStore::filtered_scan) | Equality-filtered scan ordered by a metadata key |
/// | [`stats`](VectorStore::stats) | Chunk count and pool gauges |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Commit a batch of chunks as a unit. Re-submitting the same chunk ids
    /// overwrites in place and never grows the chunk count.
    async fn upsert_batch(&self, chunks: &[ChunkRecord]) -> Result<BatchOutcome, StoreError>;

    /// Top-`k` chunks by cosine similarity to `vector`, best first.
    /// The filter is equality over metadata keys, applied natively.
    async fn dense_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Top-`k` chunks by BM25 relevance to `query`, best first. A query
    /// with no usable tokens returns an empty list.
    async fn sparse_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Equality-filtered scan, ordered by `order_by` descending with
    /// missing values last, limited to `k`. Scores are `0.0`.
    async fn filtered_scan(
        &self,
        filter: &ScanFilter,
        order_by: Option<&str>,
        k: usize,
    ) -> Result<Vec<Candidate>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
