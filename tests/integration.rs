//! End-to-end tests driving the full stack: SQLite store, durable queue,
//! retrieval engine, rerank orchestrator, and the HTTP API.
//!
//! Providers are deterministic stubs so every assertion on ranking and
//! caching is stable across runs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use fhir_harness::config::Config;
use fhir_harness::queue::{IngestQueue, SubmitError};
use fhir_harness::rerank::RerankOrchestrator;
use fhir_harness::search::RetrievalEngine;
use fhir_harness::server::{router, AppState};
use fhir_harness::store::SqliteStore;
use fhir_harness::{db, migrate};

use fhir_harness_core::models::{MetadataFilter, ResourceSubmission, ScanFilter};
use fhir_harness_core::provider::{EmbeddingProvider, ProviderError, RerankProvider};
use fhir_harness_core::store::VectorStore;

const DIMS: usize = 32;

/// Deterministic bag-of-tokens embedder; shared tokens pull vectors together.
struct TokenHashEmbedder;

fn token_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for token in text.to_lowercase().split_whitespace() {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        v[(hasher.finish() % DIMS as u64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for TokenHashEmbedder {
    fn model_name(&self) -> &str {
        "token-hash"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| token_vector(t)).collect())
    }
}

/// Reranker scoring by content length, counting invocations.
struct CountingReranker {
    calls: AtomicU32,
}

#[async_trait]
impl RerankProvider for CountingReranker {
    fn model_name(&self) -> &str {
        "counting"
    }
    async fn rerank(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(documents.iter().map(|d| d.len() as f32).collect())
    }
}

struct DownReranker;

#[async_trait]
impl RerankProvider for DownReranker {
    fn model_name(&self) -> &str {
        "down"
    }
    async fn rerank(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Network("connection refused".into()))
    }
}

struct Harness {
    _tmp: TempDir,
    pool: sqlx::SqlitePool,
    store: Arc<SqliteStore>,
    queue: Arc<IngestQueue>,
    engine: Arc<RetrievalEngine>,
    reranker: Arc<RerankOrchestrator>,
}

async fn harness() -> Harness {
    harness_with_reranker(Arc::new(CountingReranker {
        calls: AtomicU32::new(0),
    }))
    .await
}

async fn harness_with_reranker(rerank_provider: Arc<dyn RerankProvider>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}/fhx.sqlite\"\n",
        tmp.path().display()
    ))
    .unwrap();
    config.queue.workers = 2;
    config.queue.retry_base_delay_s = 0;

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let store = Arc::new(SqliteStore::new(pool.clone(), config.pool.size));
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(TokenHashEmbedder);
    let queue = IngestQueue::start(pool.clone(), store.clone(), embedder.clone(), &config)
        .await
        .unwrap();
    let engine = Arc::new(RetrievalEngine::new(
        store.clone(),
        embedder,
        config.retrieval.clone(),
        Duration::from_secs(5),
    ));
    let reranker = Arc::new(RerankOrchestrator::new(
        engine.clone(),
        rerank_provider,
        &config.rerank_cache,
        Duration::from_secs(5),
    ));

    Harness {
        _tmp: tmp,
        pool,
        store,
        queue,
        engine,
        reranker,
    }
}

fn observation(resource_id: &str, patient_id: &str, content: &str, date: &str) -> ResourceSubmission {
    ResourceSubmission {
        resource_id: resource_id.into(),
        full_url: format!("urn:uuid:{}", resource_id),
        resource_type: "Observation".into(),
        content: content.into(),
        resource_json: format!(
            r#"{{"resourceType":"Observation","id":"{}","status":"final","effectiveDateTime":"{}"}}"#,
            resource_id, date
        ),
        patient_id: Some(patient_id.into()),
        source_file: Some("bundle.json".into()),
    }
}

fn condition(resource_id: &str, patient_id: &str, content: &str, onset: &str) -> ResourceSubmission {
    ResourceSubmission {
        resource_id: resource_id.into(),
        full_url: format!("urn:uuid:{}", resource_id),
        resource_type: "Condition".into(),
        content: content.into(),
        resource_json: format!(
            r#"{{"resourceType":"Condition","id":"{}","onsetDateTime":"{}"}}"#,
            resource_id, onset
        ),
        patient_id: Some(patient_id.into()),
        source_file: None,
    }
}

async fn chunk_count(pool: &sqlx::SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_minimal_observation_end_to_end() {
    let h = harness().await;
    h.queue
        .submit(observation(
            "obs-1",
            "p-1",
            "Cholesterol total 195 mg/dL on 2024-01-15",
            "2024-01-15",
        ))
        .await
        .unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let hits = h
        .store
        .filtered_scan(&ScanFilter::default(), None, 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    let hit = &hits[0];
    assert_eq!(hit.chunk_id, "obs-1_chunk_0");
    assert_eq!(hit.metadata.patient_id.as_deref(), Some("p-1"));
    assert_eq!(hit.metadata.resource_type, "Observation");
    assert_eq!(hit.metadata.effective_date.as_deref(), Some("2024-01-15"));
    assert_eq!(hit.metadata.total_chunks, 1);
    assert_eq!(hit.metadata.chunk_index, 0);
    assert_eq!(hit.content, "Cholesterol total 195 mg/dL on 2024-01-15");
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let h = harness().await;
    let submission = observation("obs-1", "p-1", "Glucose 92 mg/dL fasting", "2024-02-02");

    h.queue.submit(submission.clone()).await.unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());
    let after_first = chunk_count(&h.pool).await;

    h.queue.submit(submission).await.unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());
    let after_second = chunk_count(&h.pool).await;

    assert_eq!(after_first, 1);
    assert_eq!(after_second, 1);
    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.dead_letter_count, 0);
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_multi_chunk_resource_commits_whole_set() {
    let h = harness().await;
    let results: Vec<String> = (0..30)
        .map(|i| {
            format!(
                r#"{{"system":"http://loinc.org","code":"code-{}","display":"Panel component {} with an expanded descriptive display value"}}"#,
                i, i
            )
        })
        .collect();
    let resource_json = format!(
        r#"{{"resourceType":"DiagnosticReport","id":"rep-1","effectiveDateTime":"2024-03-03","result":[{}]}}"#,
        results.join(",")
    );
    let submission = ResourceSubmission {
        resource_id: "rep-1".into(),
        full_url: "urn:uuid:rep-1".into(),
        resource_type: "DiagnosticReport".into(),
        content: "Comprehensive metabolic panel results".into(),
        resource_json,
        patient_id: Some("p-1".into()),
        source_file: None,
    };

    h.queue.submit(submission).await.unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let mut filter = ScanFilter::default();
    filter.equals.insert("resource_id".into(), "rep-1".into());
    let mut hits = h.store.filtered_scan(&filter, None, 100).await.unwrap();
    hits.sort_by_key(|h| h.metadata.chunk_index);

    assert!(hits.len() > 1, "large resource must split");
    let total = hits.len();
    for (i, hit) in hits.iter().enumerate() {
        assert_eq!(hit.metadata.chunk_index, i, "contiguous chunk indices");
        assert_eq!(hit.metadata.total_chunks, total);
        assert!(hit.content.chars().count() <= 1000);
        serde_json::from_str::<serde_json::Value>(&hit.content)
            .expect("preferred-strategy chunks parse as JSON");
    }
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_hybrid_ranks_matching_observation_first() {
    let h = harness().await;
    h.queue
        .submit(observation(
            "obs-1",
            "p-1",
            "Cholesterol total 195 mg/dL on 2024-01-15",
            "2024-01-15",
        ))
        .await
        .unwrap();
    for (i, text) in [
        "Essential hypertension managed with lifestyle changes",
        "Seasonal allergic rhinitis with watery eyes",
        "Chronic lower back pain after lifting injury",
        "Mild intermittent asthma since childhood",
    ]
    .iter()
    .enumerate()
    {
        h.queue
            .submit(condition(&format!("cond-{}", i), "p-1", text, "2020-01-01"))
            .await
            .unwrap();
    }
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let hits = h
        .engine
        .hybrid("cholesterol panel", 5, None, None)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].resource_id, "obs-1");
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_hybrid_auto_detection_restricts_type() {
    let h = harness().await;
    h.queue
        .submit(observation(
            "obs-1",
            "p-1",
            "Blood pressure 150 over 95 seated",
            "2024-01-15",
        ))
        .await
        .unwrap();
    h.queue
        .submit(condition(
            "cond-1",
            "p-1",
            "Essential hypertension diagnosed at annual visit",
            "2020-03-01",
        ))
        .await
        .unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let hits = h
        .engine
        .hybrid("diagnosis of hypertension", 5, None, None)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    for hit in &hits {
        assert_eq!(hit.metadata.resource_type, "Condition");
    }
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_dense_retrieves_by_content_subset() {
    let h = harness().await;
    h.queue
        .submit(observation(
            "obs-1",
            "p-1",
            "Hemoglobin A1c 6.1 percent improving with diet",
            "2024-04-01",
        ))
        .await
        .unwrap();
    h.queue
        .submit(condition(
            "cond-1",
            "p-2",
            "Type 2 diabetes mellitus without complications",
            "2018-09-09",
        ))
        .await
        .unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let hits = h
        .engine
        .dense("Hemoglobin A1c improving", 3, None)
        .await
        .unwrap();
    assert!(hits.iter().any(|hit| hit.resource_id == "obs-1"));
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_sparse_empty_for_unmatched_query() {
    let h = harness().await;
    h.queue
        .submit(observation("obs-1", "p-1", "Cholesterol 195", "2024-01-15"))
        .await
        .unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let hits = h.engine.sparse("zzzunmatched qqqtokens", 5, None).await.unwrap();
    assert!(hits.is_empty());
    let punctuation_only = h.engine.sparse("///!!!", 5, None).await.unwrap();
    assert!(punctuation_only.is_empty());
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_timeline_orders_dates_descending_nulls_last() {
    let h = harness().await;
    h.queue
        .submit(observation("obs-old", "p-1", "Old cholesterol reading", "2020-01-01"))
        .await
        .unwrap();
    h.queue
        .submit(observation("obs-new", "p-1", "New cholesterol reading", "2024-06-01"))
        .await
        .unwrap();
    // Condition without a date field lands with no effective_date.
    let undated = ResourceSubmission {
        resource_id: "cond-undated".into(),
        full_url: "urn:uuid:cond-undated".into(),
        resource_type: "Condition".into(),
        content: "Past surgical history noted".into(),
        resource_json: r#"{"resourceType":"Condition","id":"cond-undated"}"#.into(),
        patient_id: Some("p-1".into()),
        source_file: None,
    };
    h.queue.submit(undated).await.unwrap();
    h.queue
        .submit(observation("obs-other", "p-2", "Another patient entirely", "2024-01-01"))
        .await
        .unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let hits = h.engine.timeline("p-1", 10, Vec::new()).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.resource_id.as_str()).collect();
    assert_eq!(ids, vec!["obs-new", "obs-old", "cond-undated"]);
    for hit in &hits {
        assert_eq!(hit.metadata.patient_id.as_deref(), Some("p-1"));
    }

    let observations_only = h
        .engine
        .timeline("p-1", 10, vec!["Observation".into()])
        .await
        .unwrap();
    assert_eq!(observations_only.len(), 2);
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_rerank_cache_hit_on_second_call() {
    let provider = Arc::new(CountingReranker {
        calls: AtomicU32::new(0),
    });
    let h = harness_with_reranker(provider.clone()).await;
    for i in 0..4 {
        h.queue
            .submit(observation(
                &format!("obs-{}", i),
                "p-1",
                &format!("Cholesterol reading number {} from the panel", i),
                "2024-01-15",
            ))
            .await
            .unwrap();
    }
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let first = h.reranker.rerank("cholesterol", 50, 3, None).await.unwrap();
    let stats = h.reranker.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 0);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let second = h.reranker.rerank("cholesterol", 50, 3, None).await.unwrap();
    let stats = h.reranker.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1, "provider skipped on hit");

    let ids = |hits: &[fhir_harness_core::models::Candidate]| {
        hits.iter().map(|h| h.chunk_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_rerank_degrades_when_provider_down() {
    let h = harness_with_reranker(Arc::new(DownReranker)).await;
    h.queue
        .submit(observation("obs-1", "p-1", "Cholesterol 195 total", "2024-01-15"))
        .await
        .unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let hybrid = h.engine.hybrid("cholesterol", 50, None, None).await.unwrap();
    let reranked = h.reranker.rerank("cholesterol", 50, 5, None).await.unwrap();
    assert_eq!(
        hybrid.iter().map(|c| &c.chunk_id).collect::<Vec<_>>(),
        reranked.iter().map(|c| &c.chunk_id).collect::<Vec<_>>()
    );
    assert!(h.reranker.cache_stats().degraded >= 1);
    h.queue.shutdown().await;
}

// ============ HTTP API ============

async fn spawn_server(h: &Harness) -> String {
    let state = AppState {
        queue: h.queue.clone(),
        engine: h.engine.clone(),
        reranker: h.reranker.clone(),
        store: h.store.clone(),
    };
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_http_ingest_and_retrieve() {
    let h = harness().await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let accepted = client
        .post(format!("{}/ingest", base))
        .json(&serde_json::json!({
            "id": "obs-1",
            "fullUrl": "urn:uuid:obs-1",
            "resourceType": "Observation",
            "content": "Cholesterol total 195 mg/dL on 2024-01-15",
            "patientId": "p-1",
            "resourceJson": "{\"resourceType\":\"Observation\",\"id\":\"obs-1\",\"effectiveDateTime\":\"2024-01-15\"}"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 202);
    let body: serde_json::Value = accepted.json().await.unwrap();
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["id"], "obs-1");
    assert_eq!(body["resourceType"], "Observation");
    assert_eq!(body["contentLength"], 41);

    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let results: serde_json::Value = client
        .post(format!("{}/retrieve/hybrid", base))
        .json(&serde_json::json!({ "query": "cholesterol panel", "k": 5 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let hits = results["results"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], "obs-1_chunk_0");
    assert_eq!(hits[0]["metadata"]["patient_id"], "p-1");
    assert!(hits[0]["score"].is_number());

    let timeline: serde_json::Value = client
        .post(format!("{}/retrieve/timeline", base))
        .json(&serde_json::json!({ "patient_id": "p-1", "k": 10 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = timeline["results"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].get("score").is_none(), "timeline rows carry no score");

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_http_ingest_validation_rejected() {
    let h = harness().await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let rejected = client
        .post(format!("{}/ingest", base))
        .json(&serde_json::json!({
            "id": "obs-1",
            "fullUrl": "urn:uuid:obs-1",
            "resourceType": "Observation",
            "content": "   ",
            "resourceJson": "{}"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);
    let body: serde_json::Value = rejected.json().await.unwrap();
    assert_eq!(body["status"], "rejected");

    let bad_json = client
        .post(format!("{}/ingest", base))
        .json(&serde_json::json!({
            "id": "obs-2",
            "fullUrl": "urn:uuid:obs-2",
            "resourceType": "Observation",
            "content": "fine",
            "resourceJson": "{broken"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_json.status(), 400);
    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_http_stats_endpoints() {
    let h = harness().await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    h.queue
        .submit(observation("obs-1", "p-1", "Cholesterol 195", "2024-01-15"))
        .await
        .unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let store_stats: serde_json::Value = client
        .get(format!("{}/stats/store", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(store_stats["chunk_count"], 1);
    assert!(store_stats["pool_size"].is_number());

    let queue_stats: serde_json::Value = client
        .get(format!("{}/stats/queue", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queue_stats["pending"], 0);
    assert_eq!(queue_stats["dead_letter_count"], 0);

    let _ = h.reranker.rerank("cholesterol", 50, 3, None).await.unwrap();
    let cache_stats: serde_json::Value = client
        .get(format!("{}/stats/rerank-cache", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cache_stats["misses"], 1);
    assert!(cache_stats["hit_rate"].is_number());

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    h.queue.shutdown().await;
}

// Validation shortcut: the queue rejects before journaling (B1, B2).
#[tokio::test]
async fn test_submit_validation_variants() {
    let h = harness().await;

    let mut missing_id = observation("obs-1", "p-1", "text", "2024-01-01");
    missing_id.resource_id = String::new();
    assert!(matches!(
        h.queue.submit(missing_id).await,
        Err(SubmitError::Validation(_))
    ));

    let mut blank = observation("obs-2", "p-1", "ok", "2024-01-01");
    blank.content = "\n\t ".into();
    assert!(matches!(
        h.queue.submit(blank).await,
        Err(SubmitError::Validation(_))
    ));

    let mut unparseable = observation("obs-3", "p-1", "ok", "2024-01-01");
    unparseable.resource_json = "not json".into();
    assert!(matches!(
        h.queue.submit(unparseable).await,
        Err(SubmitError::Validation(_))
    ));

    assert_eq!(chunk_count(&h.pool).await, 0);
    h.queue.shutdown().await;
}

// Unused-field silencing for MetadataFilter import parity with the lib API.
#[tokio::test]
async fn test_dense_with_patient_filter() {
    let h = harness().await;
    h.queue
        .submit(observation("obs-1", "p-1", "Cholesterol 195 total", "2024-01-15"))
        .await
        .unwrap();
    h.queue
        .submit(observation("obs-2", "p-2", "Cholesterol 250 total", "2024-01-16"))
        .await
        .unwrap();
    assert!(h.queue.wait_idle(Duration::from_secs(10)).await.unwrap());

    let mut filter = MetadataFilter::new();
    filter.insert("patient_id".into(), "p-2".into());
    let hits = h
        .engine
        .dense("cholesterol total", 10, Some(filter))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].resource_id, "obs-2");
    h.queue.shutdown().await;
}
