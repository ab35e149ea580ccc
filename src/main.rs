//! # FHIR Harness CLI (`fhx`)
//!
//! The `fhx` binary drives the service: database initialization, bundle
//! ingestion, ad-hoc search, stats, and the HTTP server.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fhx init` | Create the SQLite database and run schema migrations |
//! | `fhx ingest <bundle.json>` | Ingest a FHIR Bundle through the queue |
//! | `fhx search "<query>"` | Query the store (dense, sparse, hybrid, rerank) |
//! | `fhx stats` | Print store, queue, and dead-letter counters |
//! | `fhx serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! fhx init --config ./config/fhx.toml
//! fhx ingest ./data/patient-bundle.json --config ./config/fhx.toml
//! fhx search "diagnosis of hypertension" --mode hybrid --patient p-1
//! fhx serve --config ./config/fhx.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fhir_harness::config::{load_config, Config};
use fhir_harness::ingest::ingest_bundle;
use fhir_harness::queue::IngestQueue;
use fhir_harness::rerank::RerankOrchestrator;
use fhir_harness::search::RetrievalEngine;
use fhir_harness::server::{run_server, AppState};
use fhir_harness::stats::run_stats;
use fhir_harness::store::SqliteStore;
use fhir_harness::{db, migrate, providers};
use fhir_harness_core::models::MetadataFilter;
use fhir_harness_core::store::VectorStore;

/// FHIR Harness — clinical record ingestion and hybrid retrieval.
#[derive(Parser)]
#[command(
    name = "fhx",
    about = "FHIR Harness — clinical record ingestion and hybrid retrieval service",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fhx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run schema migrations.
    Init,
    /// Ingest a FHIR Bundle file through the durable queue.
    Ingest {
        /// Path to the bundle JSON file.
        file: PathBuf,
    },
    /// Search ingested chunks.
    Search {
        /// The query text.
        query: String,
        /// Retrieval mode: dense, sparse, hybrid, or rerank.
        #[arg(long, default_value = "hybrid")]
        mode: String,
        /// Maximum results.
        #[arg(long, default_value_t = 10)]
        k: usize,
        /// Restrict to one patient id.
        #[arg(long)]
        patient: Option<String>,
        /// Restrict to one resource type (disables keyword auto-detection).
        #[arg(long)]
        resource_type: Option<String>,
    },
    /// Print store, queue, and dead-letter counters.
    Stats,
    /// Start the HTTP API server.
    Serve,
}

/// Everything a running command needs.
struct App {
    pool: sqlx::SqlitePool,
    store: Arc<SqliteStore>,
    queue: Arc<IngestQueue>,
    engine: Arc<RetrievalEngine>,
    reranker: Arc<RerankOrchestrator>,
}

async fn build_app(config: &Config) -> Result<App> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let store = Arc::new(SqliteStore::new(pool.clone(), config.pool.size));
    let embedder = providers::create_embedder(&config.embedding)?;
    let rerank_provider = providers::create_reranker(&config.reranker)?;

    let queue = IngestQueue::start(pool.clone(), store.clone(), embedder.clone(), config).await?;
    let engine = Arc::new(RetrievalEngine::new(
        store.clone(),
        embedder,
        config.retrieval.clone(),
        Duration::from_secs(config.embedding.timeout_s),
    ));
    let reranker = Arc::new(RerankOrchestrator::new(
        engine.clone(),
        rerank_provider,
        &config.rerank_cache,
        Duration::from_secs(config.reranker.timeout_s),
    ));

    Ok(App {
        pool,
        store,
        queue,
        engine,
        reranker,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }
        Commands::Ingest { file } => {
            let app = build_app(&config).await?;
            let summary = ingest_bundle(
                &app.queue,
                &file,
                Duration::from_secs(600),
            )
            .await?;
            let stats = app.queue.stats().await?;
            println!("ingest {}", file.display());
            println!("  submitted: {}", summary.submitted);
            println!("  rejected:  {}", summary.rejected);
            println!("  skipped:   {}", summary.skipped);
            println!("  dead lettered: {}", stats.dead_letter_count);
            println!("ok");
            app.queue.shutdown().await;
            app.pool.close().await;
        }
        Commands::Search {
            query,
            mode,
            k,
            patient,
            resource_type,
        } => {
            let app = build_app(&config).await?;
            let mut filter = MetadataFilter::new();
            if let Some(patient) = patient {
                filter.insert("patient_id".into(), patient);
            }
            if let Some(resource_type) = resource_type {
                filter.insert("resource_type".into(), resource_type);
            }
            let filter = if filter.is_empty() { None } else { Some(filter) };

            let results = match mode.as_str() {
                "dense" => app.engine.dense(&query, k, filter).await?,
                "sparse" => app.engine.sparse(&query, k, filter).await?,
                "hybrid" => app.engine.hybrid(&query, k, filter, None).await?,
                "rerank" => app.reranker.rerank(&query, 50, k, filter).await?,
                other => anyhow::bail!(
                    "Unknown search mode: {}. Use dense, sparse, hybrid, or rerank.",
                    other
                ),
            };

            if results.is_empty() {
                println!("No results.");
            }
            for (i, hit) in results.iter().enumerate() {
                let date = hit.metadata.effective_date.as_deref().unwrap_or("-");
                let snippet: String = hit.content.chars().take(96).collect();
                println!(
                    "{}. [{:.3}] {} {} ({})",
                    i + 1,
                    hit.score,
                    hit.metadata.resource_type,
                    hit.chunk_id,
                    date
                );
                println!("    {}", snippet);
            }
            app.queue.shutdown().await;
            app.pool.close().await;
        }
        Commands::Stats => {
            let app = build_app(&config).await?;
            run_stats(&app.pool, app.store.as_ref() as &dyn VectorStore, &app.queue).await?;
            app.queue.shutdown().await;
            app.pool.close().await;
        }
        Commands::Serve => {
            let app = build_app(&config).await?;
            let state = AppState {
                queue: app.queue.clone(),
                engine: app.engine.clone(),
                reranker: app.reranker.clone(),
                store: app.store.clone(),
            };
            run_server(&config, state).await?;
            app.pool.close().await;
        }
    }

    Ok(())
}
