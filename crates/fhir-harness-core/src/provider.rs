//! Provider traits for embedding and reranking, plus vector utilities.
//!
//! Both providers are opaque scoring functions behind a trait so the
//! pipeline and the retrieval engine never depend on a concrete backend.
//! Concrete HTTP implementations live in the root crate; tests implement
//! these traits directly.

use async_trait::async_trait;
use thiserror::Error;

/// Failure modes of an external provider call, classified at the client
/// boundary from structured status information.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rate limited: {0}")]
    RateLimited(String),
    #[error("provider timed out: {0}")]
    Timeout(String),
    #[error("provider network error: {0}")]
    Network(String),
    #[error("provider server error (status {status}): {message}")]
    Server { status: u16, message: String },
    #[error("provider rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provider returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("provider is disabled")]
    Disabled,
}

impl ProviderError {
    /// Whether the ingestion queue should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Timeout(_)
                | ProviderError::Network(_)
                | ProviderError::Server { .. }
        )
    }
}

/// Text → fixed-dimension dense vector.
///
/// Must be deterministic for identical input within one model version.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, recorded for observability.
    fn model_name(&self) -> &str;
    /// Embedding dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// (query, documents) → relevance scores in document order.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, ProviderError>;
}

/// Cosine similarity between two vectors; `0.0` on mismatch or zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if mag_a < f64::EPSILON || mag_b < f64::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
