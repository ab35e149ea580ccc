//! Store, queue, and dead-letter overview for `fhx stats`.
//!
//! Prints a quick summary of what is ingested and what failed, so batch
//! loads can be verified without hitting the HTTP endpoints.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use fhir_harness_core::store::VectorStore;

use crate::queue::IngestQueue;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(
    pool: &SqlitePool,
    store: &dyn VectorStore,
    queue: &IngestQueue,
) -> Result<()> {
    let store_stats = store.stats().await?;
    let queue_stats = queue.stats().await?;

    println!("FHIR Harness — Stats");
    println!("====================");
    println!();
    println!("  Chunks:          {}", store_stats.chunk_count);
    println!(
        "  Pool:            {} checked out / {} base (+{} overflow)",
        store_stats.pool_checked_out, store_stats.pool_size, store_stats.pool_overflow
    );
    println!();
    println!("  Queue pending:   {}", queue_stats.pending);
    println!("  Queue in flight: {}", queue_stats.in_flight);
    println!("  Retry scheduled: {}", queue_stats.retry_scheduled);
    println!("  Completed:       {}", queue_stats.done);
    println!("  Duplicates:      {}", queue_stats.duplicates);
    println!("  Dead letters:    {}", queue_stats.dead_letter_count);

    if queue_stats.dead_letter_count > 0 {
        println!();
        println!("  Recent dead letters:");
        let rows = sqlx::query(
            "SELECT resource_id, error_class, error_message FROM dead_letters \
             ORDER BY id DESC LIMIT 5",
        )
        .fetch_all(pool)
        .await?;
        for row in rows {
            println!(
                "    [{}] {} — {}",
                row.get::<String, _>("error_class"),
                row.get::<String, _>("resource_id"),
                row.get::<String, _>("error_message"),
            );
        }
    }

    Ok(())
}
