//! HTTP API for ingestion, retrieval, and observability.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Validate and enqueue one resource submission |
//! | `POST` | `/retrieve/dense` | Dense vector retrieval |
//! | `POST` | `/retrieve/sparse` | BM25 full-text retrieval |
//! | `POST` | `/retrieve/hybrid` | Weighted fusion of dense and sparse |
//! | `POST` | `/retrieve/timeline` | Patient-scoped chronological lookup |
//! | `POST` | `/retrieve/rerank` | Two-stage retrieve-then-rerank |
//! | `GET`  | `/stats/store` | Chunk count and pool gauges |
//! | `GET`  | `/stats/queue` | Queue depth and dead-letter count |
//! | `GET`  | `/stats/rerank-cache` | Cache hits, misses, degradations |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Ingestion errors answer with the submission contract
//! (`{ "status": "rejected", "reason": … }`, 400 or 503); retrieval errors
//! follow the JSON error schema:
//!
//! ```json
//! { "error": { "code": "invalid_query", "message": "missing patient_id" } }
//! ```
//!
//! Error codes: `invalid_query` (400), `embedding_provider` (502),
//! `store` (500), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients and cross-origin tool calls.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use fhir_harness_core::fusion::HybridWeights;
use fhir_harness_core::models::{Candidate, ChunkMetadata, MetadataFilter, ResourceSubmission};
use fhir_harness_core::store::VectorStore;

use crate::config::Config;
use crate::queue::{IngestQueue, SubmitError};
use crate::rerank::RerankOrchestrator;
use crate::search::{RetrievalEngine, RetrievalError};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<IngestQueue>,
    pub engine: Arc<RetrievalEngine>,
    pub reranker: Arc<RerankOrchestrator>,
    pub store: Arc<dyn VectorStore>,
}

/// Build the router; separated from [`run_server`] for tests.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/retrieve/dense", post(handle_dense))
        .route("/retrieve/sparse", post(handle_sparse))
        .route("/retrieve/hybrid", post(handle_hybrid))
        .route("/retrieve/timeline", post(handle_timeline))
        .route("/retrieve/rerank", post(handle_rerank))
        .route("/stats/store", get(handle_store_stats))
        .route("/stats/queue", get(handle_queue_stats))
        .route("/stats/rerank-cache", get(handle_cache_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve until ctrl-c, then drain the ingestion queue.
pub async fn run_server(config: &Config, state: AppState) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let queue = state.queue.clone();
    let app = router(state);

    info!(bind = %bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    queue.shutdown().await;
    Ok(())
}

// ============ Error response ============

/// JSON error body for the retrieval endpoints.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RetrievalError> for AppError {
    fn from(e: RetrievalError) -> Self {
        let status = match &e {
            RetrievalError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            RetrievalError::Embedding(_) => StatusCode::BAD_GATEWAY,
            RetrievalError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ POST /ingest ============

/// JSON request body for `POST /ingest` (parser wire format, camelCase).
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestRequest {
    id: String,
    full_url: String,
    resource_type: String,
    content: String,
    resource_json: String,
    #[serde(default)]
    patient_id: Option<String>,
    #[serde(default)]
    source_file: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestAccepted {
    status: &'static str,
    id: String,
    resource_type: String,
    content_length: usize,
}

#[derive(Serialize)]
struct IngestRejected {
    status: &'static str,
    reason: String,
}

/// Handler for `POST /ingest`.
///
/// Validates synchronously, enqueues, and acknowledges without awaiting
/// processing. Terminal failures after acceptance surface only through the
/// dead-letter log and `/stats/queue`.
async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Response {
    let submission = ResourceSubmission {
        resource_id: req.id.clone(),
        full_url: req.full_url,
        resource_type: req.resource_type.clone(),
        content: req.content.clone(),
        resource_json: req.resource_json,
        patient_id: req.patient_id,
        source_file: req.source_file,
    };

    match state.queue.submit(submission).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(IngestAccepted {
                status: "accepted",
                id: req.id,
                resource_type: req.resource_type,
                content_length: req.content.chars().count(),
            }),
        )
            .into_response(),
        Err(SubmitError::Validation(reason)) => (
            StatusCode::BAD_REQUEST,
            Json(IngestRejected {
                status: "rejected",
                reason,
            }),
        )
            .into_response(),
        Err(SubmitError::QueueFull) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(IngestRejected {
                status: "rejected",
                reason: "queue_full".to_string(),
            }),
        )
            .into_response(),
        Err(SubmitError::Journal(e)) => internal_error(e).into_response(),
    }
}

// ============ POST /retrieve/* ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    k: usize,
    #[serde(default)]
    filter: Option<MetadataFilter>,
}

#[derive(Deserialize)]
struct HybridRequest {
    query: String,
    k: usize,
    #[serde(default)]
    filter: Option<MetadataFilter>,
    #[serde(default)]
    weights: Option<WeightsBody>,
}

#[derive(Deserialize)]
struct WeightsBody {
    sparse: f64,
    dense: f64,
}

#[derive(Deserialize)]
struct TimelineRequest {
    patient_id: String,
    k: usize,
    #[serde(default)]
    resource_types: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RerankRequest {
    query: String,
    #[serde(default = "default_k_retrieve")]
    k_retrieve: usize,
    #[serde(default = "default_k_return")]
    k_return: usize,
    #[serde(default)]
    filter: Option<MetadataFilter>,
}

fn default_k_retrieve() -> usize {
    50
}
fn default_k_return() -> usize {
    10
}

#[derive(Serialize)]
struct ScoredResult {
    id: String,
    content: String,
    metadata: ChunkMetadata,
    score: f64,
}

#[derive(Serialize)]
struct UnscoredResult {
    id: String,
    content: String,
    metadata: ChunkMetadata,
}

#[derive(Serialize)]
struct ScoredResponse {
    results: Vec<ScoredResult>,
}

#[derive(Serialize)]
struct UnscoredResponse {
    results: Vec<UnscoredResult>,
}

fn scored(hits: Vec<Candidate>) -> Json<ScoredResponse> {
    Json(ScoredResponse {
        results: hits
            .into_iter()
            .map(|c| ScoredResult {
                id: c.chunk_id,
                content: c.content,
                metadata: c.metadata,
                score: c.score,
            })
            .collect(),
    })
}

async fn handle_dense(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<ScoredResponse>, AppError> {
    let hits = state.engine.dense(&req.query, req.k, req.filter).await?;
    Ok(scored(hits))
}

async fn handle_sparse(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<ScoredResponse>, AppError> {
    let hits = state.engine.sparse(&req.query, req.k, req.filter).await?;
    Ok(scored(hits))
}

async fn handle_hybrid(
    State(state): State<AppState>,
    Json(req): Json<HybridRequest>,
) -> Result<Json<ScoredResponse>, AppError> {
    let weights = req.weights.map(|w| HybridWeights {
        sparse: w.sparse,
        dense: w.dense,
    });
    let hits = state
        .engine
        .hybrid(&req.query, req.k, req.filter, weights)
        .await?;
    Ok(scored(hits))
}

async fn handle_timeline(
    State(state): State<AppState>,
    Json(req): Json<TimelineRequest>,
) -> Result<Json<UnscoredResponse>, AppError> {
    let hits = state
        .engine
        .timeline(&req.patient_id, req.k, req.resource_types.unwrap_or_default())
        .await?;
    Ok(Json(UnscoredResponse {
        results: hits
            .into_iter()
            .map(|c| UnscoredResult {
                id: c.chunk_id,
                content: c.content,
                metadata: c.metadata,
            })
            .collect(),
    }))
}

async fn handle_rerank(
    State(state): State<AppState>,
    Json(req): Json<RerankRequest>,
) -> Result<Json<ScoredResponse>, AppError> {
    let hits = state
        .reranker
        .rerank(&req.query, req.k_retrieve, req.k_return, req.filter)
        .await?;
    Ok(scored(hits))
}

// ============ GET /stats/* ============

async fn handle_store_stats(State(state): State<AppState>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e.to_string()).into_response(),
    }
}

async fn handle_queue_stats(State(state): State<AppState>) -> Response {
    match state.queue.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e.to_string()).into_response(),
    }
}

async fn handle_cache_stats(State(state): State<AppState>) -> Response {
    Json(state.reranker.cache_stats()).into_response()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
