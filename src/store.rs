//! SQLite-backed [`VectorStore`] implementation.
//!
//! Chunks live in one table with the embedding as a little-endian f32 BLOB
//! and the metadata document as JSON; an FTS5 virtual table over the chunk
//! content provides BM25 ranking for sparse search. Dense search decodes
//! candidate BLOBs and scores cosine similarity in Rust.
//!
//! The hot filter keys (`patient_id`, `resource_type`, `effective_date`)
//! are denormalized into indexed columns; any other metadata key filters
//! through `json_extract`. Driver errors are mapped onto [`StoreError`]
//! here and nowhere else.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use fhir_harness_core::models::{Candidate, ChunkRecord, MetadataFilter, ScanFilter};
use fhir_harness_core::provider::{blob_to_vec, cosine_similarity, vec_to_blob};
use fhir_harness_core::store::{BatchOutcome, StoreError, StoreStats, VectorStore};

/// Build an FTS5 MATCH expression from a free-text query.
///
/// Tokens are lowercased alphanumeric runs, individually quoted so clinical
/// codes ("E11.9", "LOINC 2339-0") cannot break FTS5 query syntax, and
/// OR-joined to match classic BM25 any-term semantics. `None` when the
/// query has no usable tokens.
fn fts_match_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    /// Configured base pool size, reported against live gauges in stats.
    pool_size: u32,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, pool_size: u32) -> Self {
        Self { pool, pool_size }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Map a driver error onto the closed store error sum.
///
/// SQLite result codes 5/6 (BUSY/LOCKED) and their extended forms are
/// transient; unique-constraint violations are conflicts; everything else
/// is internal.
fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::PoolExhausted("acquire timed out".into()),
        sqlx::Error::PoolClosed => StoreError::Unavailable("pool closed".into()),
        sqlx::Error::Io(io) => StoreError::Unavailable(io.to_string()),
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                StoreError::Conflict(db.to_string())
            } else {
                match db.code().as_deref() {
                    Some("5") | Some("6") | Some("261") | Some("262") => {
                        StoreError::Unavailable(db.to_string())
                    }
                    _ => StoreError::Internal(db.to_string()),
                }
            }
        }
        other => StoreError::Internal(other.to_string()),
    }
}

/// Push the equality filter onto a query builder as `AND` clauses.
///
/// `alias` is the chunks-table alias in the surrounding query.
fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, alias: &str, filter: &MetadataFilter) {
    for (key, value) in filter {
        match key.as_str() {
            "patient_id" | "resource_type" | "effective_date" | "resource_id" | "chunk_id" => {
                builder.push(format!(" AND {}.{} = ", alias, key));
                builder.push_bind(value.clone());
            }
            _ => {
                builder.push(format!(" AND json_extract({}.metadata, ", alias));
                builder.push_bind(format!("$.{}", key));
                builder.push(") = ");
                builder.push_bind(value.clone());
            }
        }
    }
}

fn row_to_candidate(row: &sqlx::sqlite::SqliteRow, score: f64) -> Result<Candidate, StoreError> {
    let metadata_json: String = row.get("metadata");
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| StoreError::Internal(format!("corrupt metadata document: {}", e)))?;
    Ok(Candidate {
        chunk_id: row.get("chunk_id"),
        resource_id: row.get("resource_id"),
        content: row.get("content"),
        metadata,
        score,
    })
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert_batch(&self, batch: &[ChunkRecord]) -> Result<BatchOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let mut outcome = BatchOutcome::default();

        for chunk in batch {
            let existing: bool =
                sqlx::query_scalar("SELECT COUNT(*) > 0 FROM chunks WHERE chunk_id = ?")
                    .bind(&chunk.chunk_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;

            let metadata_json = serde_json::to_string(&chunk.metadata)
                .map_err(|e| StoreError::Internal(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, resource_id, content, embedding, metadata,
                                    patient_id, resource_type, effective_date)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    resource_id = excluded.resource_id,
                    content = excluded.content,
                    embedding = excluded.embedding,
                    metadata = excluded.metadata,
                    patient_id = excluded.patient_id,
                    resource_type = excluded.resource_type,
                    effective_date = excluded.effective_date
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(&chunk.resource_id)
            .bind(&chunk.content)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(&metadata_json)
            .bind(&chunk.metadata.patient_id)
            .bind(&chunk.metadata.resource_type)
            .bind(&chunk.metadata.effective_date)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(&chunk.chunk_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            sqlx::query("INSERT INTO chunks_fts (chunk_id, content) VALUES (?, ?)")
                .bind(&chunk.chunk_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;

            if existing {
                outcome.replaced += 1;
            } else {
                outcome.inserted += 1;
            }
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(outcome)
    }

    async fn dense_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT c.chunk_id, c.resource_id, c.content, c.metadata, c.embedding \
             FROM chunks c WHERE 1 = 1",
        );
        if let Some(filter) = filter {
            push_filter(&mut builder, "c", filter);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let mut scored: Vec<Candidate> = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let similarity = cosine_similarity(vector, &blob_to_vec(&blob));
            scored.push(row_to_candidate(row, similarity)?);
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn sparse_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let match_expr = match fts_match_expression(query) {
            Some(expr) => expr,
            None => return Ok(Vec::new()),
        };

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT c.chunk_id, c.resource_id, c.content, c.metadata, chunks_fts.rank AS rank \
             FROM chunks_fts \
             JOIN chunks c ON c.chunk_id = chunks_fts.chunk_id \
             WHERE chunks_fts MATCH ",
        );
        builder.push_bind(match_expr);
        if let Some(filter) = filter {
            push_filter(&mut builder, "c", filter);
        }
        builder.push(" ORDER BY chunks_fts.rank LIMIT ");
        builder.push_bind(k as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let rank: f64 = row.get("rank");
            // FTS5 rank is "smaller is better"; negate so higher wins.
            out.push(row_to_candidate(row, -rank)?);
        }
        Ok(out)
    }

    async fn filtered_scan(
        &self,
        filter: &ScanFilter,
        order_by: Option<&str>,
        k: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT c.chunk_id, c.resource_id, c.content, c.metadata FROM chunks c WHERE 1 = 1",
        );
        push_filter(&mut builder, "c", &filter.equals);

        if !filter.resource_types.is_empty() {
            builder.push(" AND c.resource_type IN (");
            let mut separated = builder.separated(", ");
            for resource_type in &filter.resource_types {
                separated.push_bind(resource_type.clone());
            }
            builder.push(")");
        }

        match order_by {
            Some("effective_date") => {
                builder.push(
                    " ORDER BY c.effective_date IS NULL, c.effective_date DESC, c.chunk_id ASC",
                );
            }
            Some(key) => {
                let path = format!("$.{}", key);
                builder.push(" ORDER BY json_extract(c.metadata, ");
                builder.push_bind(path.clone());
                builder.push(") IS NULL, json_extract(c.metadata, ");
                builder.push_bind(path);
                builder.push(") DESC, c.chunk_id ASC");
            }
            None => {
                builder.push(" ORDER BY c.chunk_id ASC");
            }
        }
        builder.push(" LIMIT ");
        builder.push_bind(k as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.iter().map(|row| row_to_candidate(row, 0.0)).collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let live = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        Ok(StoreStats {
            chunk_count: chunk_count as u64,
            pool_size: self.pool_size,
            pool_checked_out: live.saturating_sub(idle),
            pool_overflow: live.saturating_sub(self.pool_size),
        })
    }
}
