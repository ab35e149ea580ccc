//! Retrieval engine: dense, sparse, hybrid, and timeline queries.
//!
//! All four operations run against the [`VectorStore`] abstraction and
//! return [`Candidate`]s ready for the HTTP layer. The hybrid path fans
//! the dense and sparse sub-queries out concurrently and fuses them with
//! the deterministic rank-fusion algorithm in the core crate.
//!
//! Dense and hybrid queries without an explicit `resource_type` filter
//! consult the keyword map ([`detect_resource_type`]) and scope themselves
//! to the detected type. Patient scoping is always an explicit filter
//! value; nothing here reads ambient request state.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use fhir_harness_core::fusion::{detect_resource_type, fuse_hybrid, HybridWeights};
use fhir_harness_core::models::{Candidate, MetadataFilter, ScanFilter};
use fhir_harness_core::provider::{EmbeddingProvider, ProviderError};
use fhir_harness_core::store::{StoreError, VectorStore};

use crate::config::RetrievalConfig;

/// Retrieval-path failure with its classification tag.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("embedding provider failed: {0}")]
    Embedding(#[source] ProviderError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

impl RetrievalError {
    /// Machine-readable classification for the HTTP error contract.
    pub fn kind(&self) -> &'static str {
        match self {
            RetrievalError::InvalidQuery(_) => "invalid_query",
            RetrievalError::Embedding(_) => "embedding_provider",
            RetrievalError::Store(_) => "store",
        }
    }
}

/// Stateless query engine over one store and one embedding provider.
pub struct RetrievalEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
    provider_timeout: Duration,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            provider_timeout,
        }
    }

    /// Dense ANN retrieval: embed the query, over-fetch, truncate to `k`.
    pub async fn dense(
        &self,
        query: &str,
        k: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let filter = self.effective_filter(query, filter);
        let vector = self.embed_query(query).await?;
        let k_retrieve = k.max(self.config.k_retrieve);
        let mut hits = self
            .store
            .dense_search(&vector, k_retrieve, filter.as_ref())
            .await?;
        hits.truncate(k);
        Ok(hits)
    }

    /// Sparse BM25 retrieval with the same truncation discipline.
    pub async fn sparse(
        &self,
        query: &str,
        k: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let k_retrieve = k.max(self.config.k_retrieve);
        let mut hits = self
            .store
            .sparse_search(query, k_retrieve, filter.as_ref())
            .await?;
        hits.truncate(k);
        Ok(hits)
    }

    /// Weighted fusion of concurrent dense and sparse sub-queries.
    pub async fn hybrid(
        &self,
        query: &str,
        k: usize,
        filter: Option<MetadataFilter>,
        weights: Option<HybridWeights>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let filter = self.effective_filter(query, filter);
        let weights = weights.unwrap_or(HybridWeights {
            sparse: self.config.weight_sparse,
            dense: self.config.weight_dense,
        });
        let k_retrieve = self.config.k_retrieve;

        let dense_branch = async {
            let vector = self.embed_query(query).await?;
            self.store
                .dense_search(&vector, k_retrieve, filter.as_ref())
                .await
                .map_err(RetrievalError::from)
        };
        let sparse_branch = async {
            self.store
                .sparse_search(query, k_retrieve, filter.as_ref())
                .await
                .map_err(RetrievalError::from)
        };

        let (dense, sparse) = tokio::join!(dense_branch, sparse_branch);
        Ok(fuse_hybrid(sparse?, dense?, weights, k))
    }

    /// Chronological patient lookup; no scoring, exact match only.
    pub async fn timeline(
        &self,
        patient_id: &str,
        k: usize,
        resource_types: Vec<String>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        if patient_id.trim().is_empty() {
            return Err(RetrievalError::InvalidQuery("missing patient_id".into()));
        }
        let mut filter = ScanFilter {
            resource_types,
            ..ScanFilter::default()
        };
        filter
            .equals
            .insert("patient_id".to_string(), patient_id.to_string());
        Ok(self
            .store
            .filtered_scan(&filter, Some("effective_date"), k)
            .await?)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, RetrievalError> {
        let result = tokio::time::timeout(
            self.provider_timeout,
            self.embedder.embed_batch(&[query.to_string()]),
        )
        .await
        .map_err(|_| {
            RetrievalError::Embedding(ProviderError::Timeout(format!(
                "query embedding exceeded {:?}",
                self.provider_timeout
            )))
        })?
        .map_err(RetrievalError::Embedding)?;
        result
            .into_iter()
            .next()
            .ok_or_else(|| {
                RetrievalError::Embedding(ProviderError::InvalidResponse(
                    "empty embedding response".into(),
                ))
            })
    }

    /// Add the keyword-detected resource type unless the caller already
    /// scoped the query.
    fn effective_filter(
        &self,
        query: &str,
        filter: Option<MetadataFilter>,
    ) -> Option<MetadataFilter> {
        let has_explicit_type = filter
            .as_ref()
            .map(|f| f.contains_key("resource_type"))
            .unwrap_or(false);
        if has_explicit_type {
            return filter;
        }
        if let Some(resource_type) = detect_resource_type(query) {
            debug!(resource_type, "auto-detected resource type filter");
            let mut filter = filter.unwrap_or_default();
            filter.insert("resource_type".to_string(), resource_type.to_string());
            return Some(filter);
        }
        filter
    }
}
