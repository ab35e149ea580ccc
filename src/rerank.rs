//! Two-stage retrieval: hybrid candidates re-scored by a cross-encoder,
//! with a bounded in-memory score cache.
//!
//! The cache key is a SHA-256 fingerprint over the query text and the
//! sorted candidate chunk ids. Chunk content is immutable once written
//! (re-ingest overwrites with identical content for identical input), so
//! the fingerprint fully determines the provider's scores within one model
//! version. Any future change that mutates chunk content in place must add
//! a store-version component to the fingerprint.
//!
//! Rerank provider failure is not an error: the orchestrator logs the
//! degradation, counts it, and returns the hybrid order unchanged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use fhir_harness_core::models::{Candidate, MetadataFilter};
use fhir_harness_core::provider::RerankProvider;

use crate::config::RerankCacheConfig;
use crate::search::{RetrievalEngine, RetrievalError};

/// Cache counters for the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RerankCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Rerank calls that fell back to hybrid order.
    pub degraded: u64,
}

struct CacheEntry {
    /// Provider score per chunk id of the fingerprinted candidate set.
    scores: HashMap<String, f32>,
    expires_at: Instant,
    last_used: u64,
}

/// Bounded LRU cache with TTL eviction for rerank scores.
///
/// All reads and writes serialize under one lock; eviction scans for the
/// least-recently-used entry only when the capacity bound is hit.
pub struct RerankCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RerankCache {
    pub fn new(config: &RerankCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: config.max_entries.max(1),
            ttl: Duration::from_secs(config.ttl_s),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self, fingerprint: &str) -> Option<HashMap<String, f32>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(fingerprint) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_used = self.tick.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.scores.clone())
            }
            Some(_) => {
                // Stale: evict on read.
                entries.remove(fingerprint);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(&self, fingerprint: String, scores: HashMap<String, f32>) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_entries && !entries.contains_key(&fingerprint) {
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
            }
        }
        entries.insert(
            fingerprint,
            CacheEntry {
                scores,
                expires_at: Instant::now() + self.ttl,
                last_used: self.tick.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fingerprint = SHA-256(query ∥ sorted chunk ids).
fn fingerprint(query: &str, candidates: &[Candidate]) -> String {
    let mut ids: Vec<&str> = candidates.iter().map(|c| c.chunk_id.as_str()).collect();
    ids.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    for id in ids {
        hasher.update(b"\n");
        hasher.update(id.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// The two-stage (retrieve, then rerank) orchestrator.
pub struct RerankOrchestrator {
    engine: Arc<RetrievalEngine>,
    provider: Arc<dyn RerankProvider>,
    cache: RerankCache,
    provider_timeout: Duration,
    degraded: AtomicU64,
}

impl RerankOrchestrator {
    pub fn new(
        engine: Arc<RetrievalEngine>,
        provider: Arc<dyn RerankProvider>,
        cache_config: &RerankCacheConfig,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            provider,
            cache: RerankCache::new(cache_config),
            provider_timeout,
            degraded: AtomicU64::new(0),
        }
    }

    /// Retrieve `k_retrieve` hybrid candidates, rerank, return `k_return`.
    ///
    /// Provider failure degrades to the hybrid order instead of erroring.
    pub async fn rerank(
        &self,
        query: &str,
        k_retrieve: usize,
        k_return: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let candidates = self.engine.hybrid(query, k_retrieve, filter, None).await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let key = fingerprint(query, &candidates);
        let scores = match self.cache.get(&key) {
            Some(scores) => scores,
            None => {
                let documents: Vec<String> =
                    candidates.iter().map(|c| c.content.clone()).collect();
                let scored = tokio::time::timeout(
                    self.provider_timeout,
                    self.provider.rerank(query, &documents),
                )
                .await;
                match scored {
                    Ok(Ok(scores)) if scores.len() == documents.len() => {
                        let map: HashMap<String, f32> = candidates
                            .iter()
                            .zip(scores.iter())
                            .map(|(c, s)| (c.chunk_id.clone(), *s))
                            .collect();
                        self.cache.insert(key, map.clone());
                        map
                    }
                    Ok(Ok(scores)) => {
                        warn!(
                            expected = documents.len(),
                            got = scores.len(),
                            "reranker returned wrong score count, using hybrid order"
                        );
                        return Ok(self.degrade(candidates, k_return));
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "reranker unavailable, using hybrid order");
                        return Ok(self.degrade(candidates, k_return));
                    }
                    Err(_) => {
                        warn!("reranker timed out, using hybrid order");
                        return Ok(self.degrade(candidates, k_return));
                    }
                }
            }
        };

        // Stable sort keeps the hybrid order for equal scores, matching the
        // ordering the cross-encoder service itself would return.
        let mut reranked: Vec<Candidate> = candidates;
        reranked.sort_by(|a, b| {
            let sa = scores.get(&a.chunk_id).copied().unwrap_or(f32::MIN);
            let sb = scores.get(&b.chunk_id).copied().unwrap_or(f32::MIN);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        for candidate in &mut reranked {
            if let Some(score) = scores.get(&candidate.chunk_id) {
                candidate.score = *score as f64;
            }
        }
        reranked.truncate(k_return);
        Ok(reranked)
    }

    fn degrade(&self, mut candidates: Vec<Candidate>, k_return: usize) -> Vec<Candidate> {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        candidates.truncate(k_return);
        candidates
    }

    pub fn cache_stats(&self) -> RerankCacheStats {
        let hits = self.cache.hits.load(Ordering::Relaxed);
        let misses = self.cache.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        RerankCacheStats {
            entries: self.cache.len(),
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}
