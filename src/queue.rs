//! Durable, bounded ingestion queue.
//!
//! A bounded FIFO work queue backed by a SQLite journal. Every accepted
//! submission is journaled before it is acted on; a pool of workers pulls
//! items off a bounded channel, runs the ingestion pipeline, and records
//! the terminal state. On process start, pending work is reloaded from the
//! journal, so accepted submissions survive a crash (at-least-once, made
//! safe by the store's idempotent upsert).
//!
//! # Work item state machine
//!
//! ```text
//! pending → in_flight → (done | retry_scheduled | dead_letter)
//! retry_scheduled → pending            (after the backoff elapses)
//! ```
//!
//! `done` removes the journal row; `dead_letter` moves the item into the
//! append-only dead-letter log and removes the row. An item `in_flight`
//! at crash time is reset to `pending` on the next start.
//!
//! # Retry policy
//!
//! Retryable failures back off exponentially: `min(base · 2^n, cap)` for
//! the n-th retry. When the retry count reaches `max_retries` the item is
//! dead-lettered with class `max_retries`, preserving the last error.
//!
//! # Shutdown
//!
//! [`IngestQueue::shutdown`] stops admission, signals the workers, and
//! waits up to the drain timeout for in-flight items to finish. Items not
//! drained remain `pending` in the journal for the next run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fhir_harness_core::chunk::ChunkLimits;
use fhir_harness_core::models::{ErrorClass, ResourceSubmission};
use fhir_harness_core::provider::EmbeddingProvider;
use fhir_harness_core::store::VectorStore;

use crate::config::Config;
use crate::pipeline::process_submission;

const STATE_PENDING: &str = "pending";
const STATE_IN_FLIGHT: &str = "in_flight";
const STATE_RETRY_SCHEDULED: &str = "retry_scheduled";

/// Rejection reasons for [`IngestQueue::submit`].
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The submission is structurally invalid; nothing was enqueued.
    #[error("{0}")]
    Validation(String),
    /// The queue is at capacity or shutting down.
    #[error("queue_full")]
    QueueFull,
    /// The journal could not record the submission.
    #[error("journal error: {0}")]
    Journal(String),
}

/// Queue gauges and counters for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub retry_scheduled: u64,
    pub dead_letter_count: u64,
    pub done: u64,
    pub duplicates: u64,
}

struct Inner {
    pool: SqlitePool,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    limits: ChunkLimits,
    max_retries: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    provider_timeout: Duration,
    enqueue_wait: Duration,
    tx: mpsc::Sender<i64>,
    shutdown_tx: watch::Sender<bool>,
    accepting: AtomicBool,
    done: AtomicU64,
    duplicates: AtomicU64,
}

/// The durable ingestion queue. Owns every in-flight work item from
/// acceptance to its terminal state.
pub struct IngestQueue {
    inner: Arc<Inner>,
    drain_timeout: Duration,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl IngestQueue {
    /// Start the queue: recover journaled work, then spawn the worker pool.
    pub async fn start(
        pool: SqlitePool,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel::<i64>(config.queue.capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            pool,
            store,
            embedder,
            limits: ChunkLimits {
                min_chars: config.chunking.min_chars,
                max_chars: config.chunking.max_chars,
                overlap_chars: config.chunking.overlap_chars,
            },
            max_retries: config.queue.max_retries,
            retry_base_delay: Duration::from_secs(config.queue.retry_base_delay_s),
            retry_max_delay: Duration::from_secs(config.queue.retry_max_delay_s),
            provider_timeout: Duration::from_secs(config.embedding.timeout_s),
            enqueue_wait: Duration::from_millis(config.queue.enqueue_wait_ms),
            tx,
            shutdown_tx,
            accepting: AtomicBool::new(true),
            done: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        });

        let recovered = recover_journal(&inner.pool).await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "requeueing journaled work items");
            let feeder = inner.clone();
            tokio::spawn(async move {
                for seq in recovered {
                    if feeder.tx.send(seq).await.is_err() {
                        break;
                    }
                }
            });
        }

        let worker_count = config.queue.resolved_workers();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let inner = inner.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(worker_loop(id, inner, rx)));
        }
        debug!(workers = worker_count, capacity = config.queue.capacity, "ingestion queue started");

        Ok(Arc::new(Self {
            inner,
            drain_timeout: Duration::from_secs(config.queue.drain_timeout_s),
            workers: std::sync::Mutex::new(workers),
        }))
    }

    /// Validate and enqueue one submission.
    ///
    /// Acknowledges without awaiting processing; failures after acceptance
    /// are observable only through the dead-letter log and stats.
    pub async fn submit(&self, submission: ResourceSubmission) -> Result<(), SubmitError> {
        validate(&submission)?;

        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::QueueFull);
        }

        let now = chrono::Utc::now().timestamp();
        let payload = serde_json::to_string(&submission)
            .map_err(|e| SubmitError::Journal(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO ingest_journal (resource_id, payload, state, retry_count, created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&submission.resource_id)
        .bind(&payload)
        .bind(STATE_PENDING)
        .bind(now)
        .bind(now)
        .execute(&self.inner.pool)
        .await
        .map_err(|e| SubmitError::Journal(e.to_string()))?;
        let seq = result.last_insert_rowid();

        let enqueued = if self.inner.enqueue_wait.is_zero() {
            self.inner.tx.try_send(seq).is_ok()
        } else {
            self.inner
                .tx
                .send_timeout(seq, self.inner.enqueue_wait)
                .await
                .is_ok()
        };

        if !enqueued {
            // Back out the journal row; the caller sees backpressure.
            let _ = sqlx::query("DELETE FROM ingest_journal WHERE seq = ?")
                .bind(seq)
                .execute(&self.inner.pool)
                .await;
            return Err(SubmitError::QueueFull);
        }
        Ok(())
    }

    /// Stop admission, drain workers up to the configured timeout, and
    /// abandon whatever did not finish (it stays `pending` in the journal).
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap();
            guard.drain(..).collect()
        };
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("worker exceeded drain timeout, abandoning current item");
            }
        }
        info!("ingestion queue drained");
    }

    /// Current journal and counter snapshot.
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats {
            done: self.inner.done.load(Ordering::Relaxed),
            duplicates: self.inner.duplicates.load(Ordering::Relaxed),
            ..QueueStats::default()
        };
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM ingest_journal GROUP BY state")
            .fetch_all(&self.inner.pool)
            .await?;
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match state.as_str() {
                STATE_PENDING => stats.pending = n as u64,
                STATE_IN_FLIGHT => stats.in_flight = n as u64,
                STATE_RETRY_SCHEDULED => stats.retry_scheduled = n as u64,
                _ => {}
            }
        }
        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.inner.pool)
            .await?;
        stats.dead_letter_count = dead as u64;
        Ok(stats)
    }

    /// Wait until every journaled item reaches a terminal state, or the
    /// timeout elapses. Used by the bundle ingest command and tests.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let open: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_journal")
                .fetch_one(&self.inner.pool)
                .await?;
            if open == 0 {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Synchronous C7 validation; failures never touch the journal.
fn validate(submission: &ResourceSubmission) -> Result<(), SubmitError> {
    if submission.resource_id.trim().is_empty() {
        return Err(SubmitError::Validation("missing resource_id".into()));
    }
    if submission.content.trim().is_empty() {
        return Err(SubmitError::Validation("missing content".into()));
    }
    if submission.resource_json.trim().is_empty() {
        return Err(SubmitError::Validation("missing resource_json".into()));
    }
    if serde_json::from_str::<serde_json::Value>(&submission.resource_json).is_err() {
        return Err(SubmitError::Validation("resource_json does not parse".into()));
    }
    Ok(())
}

/// Reset interrupted work to `pending` and return every pending seq in
/// FIFO order.
async fn recover_journal(pool: &SqlitePool) -> Result<Vec<i64>> {
    sqlx::query(
        "UPDATE ingest_journal SET state = ?, updated_at = ? WHERE state IN (?, ?)",
    )
    .bind(STATE_PENDING)
    .bind(chrono::Utc::now().timestamp())
    .bind(STATE_IN_FLIGHT)
    .bind(STATE_RETRY_SCHEDULED)
    .execute(pool)
    .await?;

    let rows = sqlx::query("SELECT seq FROM ingest_journal WHERE state = ? ORDER BY seq")
        .bind(STATE_PENDING)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get::<i64, _>("seq")).collect())
}

async fn worker_loop(worker_id: usize, inner: Arc<Inner>, rx: Arc<Mutex<mpsc::Receiver<i64>>>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    loop {
        let seq = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                item = guard.recv() => match item {
                    Some(seq) => seq,
                    None => break,
                },
            }
        };
        if let Err(e) = process_item(&inner, seq).await {
            // Journal I/O failed mid-transition; the item stays in its
            // last journaled state and is recovered on the next start.
            error!(worker_id, seq, error = %e, "work item transition failed");
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn process_item(inner: &Arc<Inner>, seq: i64) -> Result<()> {
    let row = sqlx::query(
        "SELECT payload, retry_count, created_at FROM ingest_journal WHERE seq = ? AND state = ?",
    )
    .bind(seq)
    .bind(STATE_PENDING)
    .fetch_optional(&inner.pool)
    .await?;
    let Some(row) = row else {
        // Already terminal or claimed; the channel hands each seq to one
        // worker, so this only happens after replayed recovery feeds.
        return Ok(());
    };
    let payload: String = row.get("payload");
    let retry_count: u32 = row.get::<i64, _>("retry_count") as u32;
    let first_seen: i64 = row.get("created_at");

    set_state(&inner.pool, seq, STATE_IN_FLIGHT).await?;

    let submission: ResourceSubmission = match serde_json::from_str(&payload) {
        Ok(s) => s,
        Err(e) => {
            warn!(seq, error = %e, "journal payload does not deserialize");
            dead_letter(
                inner,
                seq,
                &fallback_submission(&payload),
                ErrorClass::Fatal,
                &format!("corrupt journal payload: {}", e),
                retry_count,
                first_seen,
            )
            .await?;
            return Ok(());
        }
    };

    let result = process_submission(
        inner.store.as_ref(),
        inner.embedder.as_ref(),
        &inner.limits,
        inner.provider_timeout,
        &submission,
    )
    .await;

    match result {
        Ok(outcome) => {
            if outcome.is_all_duplicates() {
                inner.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            inner.done.fetch_add(1, Ordering::Relaxed);
            remove_item(&inner.pool, seq).await?;
            debug!(seq, resource_id = %submission.resource_id, "work item done");
        }
        Err(e) => match e.classify() {
            ErrorClass::Duplicate => {
                // Chunks already present; success from the item's view.
                inner.duplicates.fetch_add(1, Ordering::Relaxed);
                inner.done.fetch_add(1, Ordering::Relaxed);
                remove_item(&inner.pool, seq).await?;
            }
            ErrorClass::Retryable => {
                let attempts = retry_count + 1;
                if attempts >= inner.max_retries {
                    warn!(seq, resource_id = %submission.resource_id, attempts,
                          "retries exhausted, dead-lettering");
                    dead_letter(
                        inner,
                        seq,
                        &submission,
                        ErrorClass::MaxRetries,
                        &e.to_string(),
                        attempts,
                        first_seen,
                    )
                    .await?;
                } else {
                    schedule_retry(inner, seq, attempts, &e.to_string()).await?;
                }
            }
            class => {
                warn!(seq, resource_id = %submission.resource_id, class = %class,
                      error = %e, "work item terminally failed");
                dead_letter(inner, seq, &submission, class, &e.to_string(), retry_count, first_seen)
                    .await?;
            }
        },
    }
    Ok(())
}

/// Placeholder submission for dead-lettering a corrupt journal payload.
fn fallback_submission(payload: &str) -> ResourceSubmission {
    ResourceSubmission {
        resource_id: format!("unknown:{:.40}", payload),
        full_url: String::new(),
        resource_type: String::new(),
        content: String::new(),
        resource_json: String::new(),
        patient_id: None,
        source_file: None,
    }
}

async fn set_state(pool: &SqlitePool, seq: i64, state: &str) -> Result<()> {
    sqlx::query("UPDATE ingest_journal SET state = ?, updated_at = ? WHERE seq = ?")
        .bind(state)
        .bind(chrono::Utc::now().timestamp())
        .bind(seq)
        .execute(pool)
        .await?;
    Ok(())
}

async fn remove_item(pool: &SqlitePool, seq: i64) -> Result<()> {
    sqlx::query("DELETE FROM ingest_journal WHERE seq = ?")
        .bind(seq)
        .execute(pool)
        .await?;
    Ok(())
}

/// Journal the retry, then requeue the seq once the backoff elapses.
async fn schedule_retry(inner: &Arc<Inner>, seq: i64, attempts: u32, last_error: &str) -> Result<()> {
    let delay = backoff_delay(
        inner.retry_base_delay,
        inner.retry_max_delay,
        attempts.saturating_sub(1),
    );
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE ingest_journal SET state = ?, retry_count = ?, last_error = ?, \
         next_attempt_at = ?, updated_at = ? WHERE seq = ?",
    )
    .bind(STATE_RETRY_SCHEDULED)
    .bind(attempts as i64)
    .bind(last_error)
    .bind(now + delay.as_secs() as i64)
    .bind(now)
    .bind(seq)
    .execute(&inner.pool)
    .await?;
    debug!(seq, attempts, delay_s = delay.as_secs(), "retry scheduled");

    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let requeued = sqlx::query(
            "UPDATE ingest_journal SET state = ?, updated_at = ? WHERE seq = ? AND state = ?",
        )
        .bind(STATE_PENDING)
        .bind(chrono::Utc::now().timestamp())
        .bind(seq)
        .bind(STATE_RETRY_SCHEDULED)
        .execute(&inner.pool)
        .await;
        match requeued {
            Ok(result) if result.rows_affected() == 1 => {
                // A failed send leaves the row pending for the next start.
                let _ = inner.tx.send(seq).await;
            }
            Ok(_) => {}
            Err(e) => error!(seq, error = %e, "failed to requeue retry"),
        }
    });
    Ok(())
}

/// `min(base · 2^n, cap)` for the n-th retry.
fn backoff_delay(base: Duration, cap: Duration, n: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(n.min(30)));
    exp.min(cap)
}

#[allow(clippy::too_many_arguments)]
async fn dead_letter(
    inner: &Arc<Inner>,
    seq: i64,
    submission: &ResourceSubmission,
    class: ErrorClass,
    message: &str,
    retry_count: u32,
    first_seen: i64,
) -> Result<()> {
    let metadata = serde_json::json!({
        "patient_id": submission.patient_id,
        "resource_type": submission.resource_type,
        "full_url": submission.full_url,
        "source_file": submission.source_file,
    });
    sqlx::query(
        "INSERT INTO dead_letters (chunk_id, resource_id, error_class, error_message, \
         retry_count, first_seen, last_seen, metadata) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Option::<String>::None)
    .bind(&submission.resource_id)
    .bind(class.as_str())
    .bind(message)
    .bind(retry_count as i64)
    .bind(first_seen)
    .bind(chrono::Utc::now().timestamp())
    .bind(metadata.to_string())
    .execute(&inner.pool)
    .await?;
    remove_item(&inner.pool, seq).await?;
    Ok(())
}
