//! HTTP-backed embedding and rerank providers.
//!
//! Concrete implementations of the core provider traits:
//! - **OpenAI-compatible** embeddings (`POST /v1/embeddings`, bearer auth).
//! - **Ollama** embeddings (`POST /api/embed`).
//! - **HTTP cross-encoder** reranker (`POST /rerank`).
//! - **Disabled** variants for deployments without a backend; a disabled
//!   reranker makes every rerank call degrade to hybrid order.
//!
//! # Retry Strategy
//!
//! Embedding calls retry transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Errors are classified from status codes into [`ProviderError`] at this
//! boundary; the queue never inspects messages.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

use fhir_harness_core::provider::{EmbeddingProvider, ProviderError, RerankProvider};

use crate::config::{EmbeddingConfig, RerankerConfig};

/// Build the configured embedding provider.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Build the configured rerank provider.
pub fn create_reranker(config: &RerankerConfig) -> Result<Arc<dyn RerankProvider>> {
    match config.provider.as_str() {
        "http" => Ok(Arc::new(HttpReranker::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledReranker)),
        other => bail!("Unknown rerank provider: {}", other),
    }
}

fn classify_status(status: u16, message: String) -> ProviderError {
    if status == 429 {
        ProviderError::RateLimited(message)
    } else if (500..600).contains(&status) {
        ProviderError::Server { status, message }
    } else {
        ProviderError::Rejected { status, message }
    }
}

fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

async fn backoff(attempt: u32) {
    // 1s, 2s, 4s, ... capped at 32s.
    let delay = Duration::from_secs(1 << attempt.min(5));
    tokio::time::sleep(delay).await;
}

// ============ Disabled providers ============

/// Embedding provider for deployments without an embedding backend.
/// Every call fails with [`ProviderError::Disabled`].
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

/// Rerank provider that always fails, driving the degrade-to-hybrid path.
pub struct DisabledReranker;

#[async_trait]
impl RerankProvider for DisabledReranker {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn rerank(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

// ============ OpenAI-compatible embeddings ============

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

/// Embedding provider speaking the OpenAI embeddings wire format.
///
/// Works against api.openai.com or any compatible gateway via `base_url`.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            model,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }

        let parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        validate_embeddings(
            parsed.data.into_iter().map(|d| d.embedding).collect(),
            texts.len(),
            self.dims,
        )
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        retry_embed(self.max_retries, || self.request(texts)).await
    }
}

// ============ Ollama embeddings ============

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedding provider for a local Ollama instance (`/api/embed`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        validate_embeddings(parsed.embeddings, texts.len(), self.dims)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        retry_embed(self.max_retries, || self.request(texts)).await
    }
}

async fn retry_embed<F, Fut>(max_retries: u32, call: F) -> Result<Vec<Vec<f32>>, ProviderError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Vec<f32>>, ProviderError>>,
{
    let mut last_err = None;
    for attempt in 0..=max_retries {
        if attempt > 0 {
            backoff(attempt - 1).await;
        }
        match call().await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_retryable() => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderError::Network("embedding failed after retries".into())))
}

fn validate_embeddings(
    vectors: Vec<Vec<f32>>,
    expected_count: usize,
    expected_dims: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    if vectors.len() != expected_count {
        return Err(ProviderError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected_count,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected_dims) {
        return Err(ProviderError::InvalidResponse(format!(
            "expected dimension {}, got {}",
            expected_dims,
            bad.len()
        )));
    }
    Ok(vectors)
}

// ============ HTTP cross-encoder reranker ============

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

/// Rerank provider calling an external cross-encoder scoring service.
///
/// `POST <base_url>/rerank` with `{ query, documents }`, expecting
/// `{ scores }` in document order.
pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("reranker.base_url required for HTTP provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()?;

        Ok(Self {
            client,
            base_url,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "cross-encoder".to_string()),
        })
    }
}

#[async_trait]
impl RerankProvider for HttpReranker {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, ProviderError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "query": query,
            "documents": documents,
            "model": self.model,
        });
        let response = self
            .client
            .post(format!("{}/rerank", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if parsed.scores.len() != documents.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} scores, got {}",
                documents.len(),
                parsed.scores.len()
            )));
        }
        Ok(parsed.scores)
    }
}
