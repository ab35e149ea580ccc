//! Per-item ingestion processing.
//!
//! One worker unit takes a validated submission all the way to a committed
//! batch: parse the resource JSON, chunk it, extract metadata, embed every
//! chunk text, and upsert the whole batch atomically. The batch commit is
//! the item's commit point; chunks of one resource are never visible
//! partially.
//!
//! Failures keep their typed source so the queue can classify them onto
//! the closed [`ErrorClass`] sum without looking at message text.

use std::time::Duration;

use thiserror::Error;

use fhir_harness_core::chunk::{chunk_resource, ChunkLimits};
use fhir_harness_core::metadata::extract_metadata;
use fhir_harness_core::models::{chunk_id, ChunkRecord, ErrorClass, ResourceSubmission};
use fhir_harness_core::provider::{EmbeddingProvider, ProviderError};
use fhir_harness_core::store::{BatchOutcome, StoreError, VectorStore};

/// Failure of one worker unit, retaining its typed source.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Map onto the closed error classification, once, at this boundary.
    pub fn classify(&self) -> ErrorClass {
        match self {
            PipelineError::Validation(_) => ErrorClass::Validation,
            PipelineError::Provider(e) if e.is_retryable() => ErrorClass::Retryable,
            PipelineError::Provider(_) => ErrorClass::Fatal,
            PipelineError::Store(StoreError::Conflict(_)) => ErrorClass::Duplicate,
            PipelineError::Store(e) if e.is_retryable() => ErrorClass::Retryable,
            PipelineError::Store(_) => ErrorClass::Fatal,
        }
    }
}

/// Process one submission end to end: chunk, enrich, embed, commit.
///
/// Every external call is bounded by `provider_timeout`. Returns the batch
/// outcome so the caller can count duplicate re-ingests.
pub async fn process_submission(
    store: &dyn VectorStore,
    embedder: &dyn EmbeddingProvider,
    limits: &ChunkLimits,
    provider_timeout: Duration,
    submission: &ResourceSubmission,
) -> Result<BatchOutcome, PipelineError> {
    let resource: serde_json::Value = serde_json::from_str(&submission.resource_json)
        .map_err(|e| PipelineError::Validation(format!("resource_json does not parse: {}", e)))?;

    let texts: Vec<String> = chunk_resource(&submission.resource_json, &submission.content, limits)
        .into_iter()
        .filter(|t| !t.trim().is_empty())
        .collect();
    if texts.is_empty() {
        return Err(PipelineError::Validation(
            "empty content after chunking".to_string(),
        ));
    }

    let embeddings = tokio::time::timeout(provider_timeout, embedder.embed_batch(&texts))
        .await
        .map_err(|_| {
            PipelineError::Provider(ProviderError::Timeout(format!(
                "embedding exceeded {:?}",
                provider_timeout
            )))
        })??;
    if embeddings.len() != texts.len() {
        return Err(PipelineError::Provider(ProviderError::InvalidResponse(
            format!("{} embeddings for {} chunks", embeddings.len(), texts.len()),
        )));
    }

    let total_chunks = texts.len();
    let records: Vec<ChunkRecord> = texts
        .into_iter()
        .zip(embeddings.into_iter())
        .enumerate()
        .map(|(index, (content, embedding))| {
            let metadata = extract_metadata(&resource, submission, &content, index, total_chunks);
            ChunkRecord {
                chunk_id: chunk_id(&submission.resource_id, index),
                resource_id: submission.resource_id.clone(),
                content,
                embedding,
                metadata,
            }
        })
        .collect();

    Ok(store.upsert_batch(&records).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fhir_harness_core::store::memory::InMemoryStore;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32; 4]).collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Err(ProviderError::RateLimited("slow down".into()))
        }
    }

    fn submission(resource_id: &str, content: &str, resource_json: &str) -> ResourceSubmission {
        ResourceSubmission {
            resource_id: resource_id.into(),
            full_url: format!("urn:uuid:{}", resource_id),
            resource_type: "Observation".into(),
            content: content.into(),
            resource_json: resource_json.into(),
            patient_id: Some("p-1".into()),
            source_file: None,
        }
    }

    #[tokio::test]
    async fn test_process_commits_all_chunks() {
        let store = InMemoryStore::new();
        let sub = submission(
            "obs-1",
            "Cholesterol total 195 mg/dL on 2024-01-15",
            r#"{"resourceType":"Observation","status":"final","effectiveDateTime":"2024-01-15"}"#,
        );

        let outcome = process_submission(
            &store,
            &StubEmbedder,
            &ChunkLimits::default(),
            Duration::from_secs(30),
            &sub,
        )
        .await
        .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(store.len(), 1);
        let hits = store
            .filtered_scan(&Default::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "obs-1_chunk_0");
        assert_eq!(hits[0].metadata.effective_date.as_deref(), Some("2024-01-15"));
        assert_eq!(hits[0].metadata.total_chunks, 1);
    }

    #[tokio::test]
    async fn test_reingest_is_duplicate_not_growth() {
        let store = InMemoryStore::new();
        let sub = submission("obs-1", "content text", r#"{"resourceType":"Observation"}"#);

        let first = process_submission(
            &store,
            &StubEmbedder,
            &ChunkLimits::default(),
            Duration::from_secs(30),
            &sub,
        )
        .await
        .unwrap();
        let second = process_submission(
            &store,
            &StubEmbedder,
            &ChunkLimits::default(),
            Duration::from_secs(30),
            &sub,
        )
        .await
        .unwrap();

        assert!(!first.is_all_duplicates());
        assert!(second.is_all_duplicates());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_json_is_validation() {
        let store = InMemoryStore::new();
        let sub = submission("obs-1", "content", "{broken");
        let err = process_submission(
            &store,
            &StubEmbedder,
            &ChunkLimits::default(),
            Duration::from_secs(30),
            &sub,
        )
        .await
        .unwrap_err();
        assert_eq!(err.classify(), ErrorClass::Validation);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_classifies_retryable() {
        let store = InMemoryStore::new();
        let sub = submission("obs-1", "content", r#"{"resourceType":"Observation"}"#);
        let err = process_submission(
            &store,
            &FailingEmbedder,
            &ChunkLimits::default(),
            Duration::from_secs(30),
            &sub,
        )
        .await
        .unwrap_err();
        assert_eq!(err.classify(), ErrorClass::Retryable);
    }

    #[test]
    fn test_store_conflict_classifies_duplicate() {
        let err = PipelineError::Store(StoreError::Conflict("unique".into()));
        assert_eq!(err.classify(), ErrorClass::Duplicate);
        let err = PipelineError::Store(StoreError::Internal("bug".into()));
        assert_eq!(err.classify(), ErrorClass::Fatal);
        let err = PipelineError::Store(StoreError::PoolExhausted("busy".into()));
        assert_eq!(err.classify(), ErrorClass::Retryable);
    }
}
