//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution.
//! Designed to be run via `fhx init`.
//!
//! # Schema
//!
//! ```text
//! ┌────────────────┐    ┌────────────────┐    ┌────────────────┐
//! │    chunks      │    │  chunks_fts    │    │ ingest_journal │
//! │                │    │  (FTS5)        │    │                │
//! │ chunk_id (PK)  │───▶│ chunk_id       │    │ seq (PK)       │
//! │ resource_id    │    │ content        │    │ resource_id    │
//! │ content        │    └────────────────┘    │ payload        │
//! │ embedding BLOB │                          │ state          │
//! │ metadata JSON  │    ┌────────────────┐    │ retry_count    │
//! │ patient_id     │    │  dead_letters  │    │ last_error     │
//! │ resource_type  │    │                │    │ next_attempt_at│
//! │ effective_date │    │ id (PK)        │    │ created_at     │
//! └────────────────┘    │ chunk_id       │    │ updated_at     │
//!                       │ resource_id    │    └────────────────┘
//!                       │ error_class    │
//!                       │ error_message  │
//!                       │ retry_count    │
//!                       │ first_seen     │
//!                       │ last_seen      │
//!                       │ metadata       │
//!                       └────────────────┘
//! ```
//!
//! `patient_id`, `resource_type`, and `effective_date` are denormalized out
//! of the metadata document so the hot filters run on indexed columns; every
//! other metadata key is filtered through `json_extract`.
//!
//! # Idempotency
//!
//! All operations use `CREATE TABLE IF NOT EXISTS` or check for existing
//! objects before creation. Running `fhx init` multiple times is safe.

use anyhow::Result;
use sqlx::SqlitePool;

/// Run all database migrations against an open pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Chunk store: one row per persisted chunk, idempotent by chunk_id.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            resource_id TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata TEXT NOT NULL,
            patient_id TEXT,
            resource_type TEXT NOT NULL,
            effective_date TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over chunk content (not idempotent natively, check first)
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Ingestion journal: one row per enqueued, not-yet-terminated item.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_journal (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_attempt_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Dead-letter log: append-only record of terminal ingestion failures.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id TEXT,
            resource_id TEXT NOT NULL,
            error_class TEXT NOT NULL,
            error_message TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            metadata TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the hot filter and scan paths
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_resource_id ON chunks(resource_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_patient_id ON chunks(patient_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_resource_type ON chunks(resource_type)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_effective_date ON chunks(effective_date DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_journal_state ON ingest_journal(state)")
        .execute(pool)
        .await?;

    Ok(())
}
