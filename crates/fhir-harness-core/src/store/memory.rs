//! In-memory [`VectorStore`] for tests.
//!
//! Chunks live in a `BTreeMap` keyed by `chunk_id` behind an `RwLock`, so
//! scans are deterministic. Dense search is brute-force cosine similarity;
//! sparse search is a small BM25 ranker using the same constants as SQLite
//! FTS5 (k1 = 1.2, b = 0.75) so determinism tests hold on both backends.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::models::{Candidate, ChunkRecord, MetadataFilter, ScanFilter};
use crate::provider::cosine_similarity;

use super::{BatchOutcome, StoreError, StoreStats, VectorStore};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// In-memory store for unit and pipeline tests.
#[derive(Default)]
pub struct InMemoryStore {
    chunks: RwLock<BTreeMap<String, ChunkRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(record: &ChunkRecord, filter: Option<&MetadataFilter>) -> bool {
        match filter {
            None => true,
            Some(map) => map
                .iter()
                .all(|(key, value)| record.metadata.get(key).as_deref() == Some(value.as_str())),
        }
    }

    fn candidate(record: &ChunkRecord, score: f64) -> Candidate {
        Candidate {
            chunk_id: record.chunk_id.clone(),
            resource_id: record.resource_id.clone(),
            content: record.content.clone(),
            metadata: record.metadata.clone(),
            score,
        }
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert_batch(&self, batch: &[ChunkRecord]) -> Result<BatchOutcome, StoreError> {
        let mut chunks = self.chunks.write().unwrap();
        let mut outcome = BatchOutcome::default();
        for record in batch {
            if chunks.insert(record.chunk_id.clone(), record.clone()).is_some() {
                outcome.replaced += 1;
            } else {
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn dense_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let chunks = self.chunks.read().unwrap();
        let mut scored: Vec<Candidate> = chunks
            .values()
            .filter(|record| Self::matches(record, filter))
            .map(|record| Self::candidate(record, cosine_similarity(vector, &record.embedding)))
            .collect();

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
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = self.chunks.read().unwrap();
        let corpus: Vec<&ChunkRecord> = chunks
            .values()
            .filter(|record| Self::matches(record, filter))
            .collect();
        if corpus.is_empty() {
            return Ok(Vec::new());
        }

        let docs: Vec<Vec<String>> = corpus.iter().map(|r| tokenize(&r.content)).collect();
        let n = docs.len() as f64;
        let avgdl = docs.iter().map(|d| d.len() as f64).sum::<f64>() / n;

        let mut doc_freq: HashMap<&str, f64> = HashMap::new();
        for term in &terms {
            let df = docs
                .iter()
                .filter(|doc| doc.iter().any(|t| t == term))
                .count() as f64;
            doc_freq.insert(term.as_str(), df);
        }

        let mut scored: Vec<Candidate> = Vec::new();
        for (record, doc) in corpus.iter().zip(docs.iter()) {
            let dl = doc.len() as f64;
            let mut score = 0.0;
            for term in &terms {
                let tf = doc.iter().filter(|t| *t == term).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let df = doc_freq[term.as_str()];
                let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                score += idf * (tf * (BM25_K1 + 1.0))
                    / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl.max(f64::EPSILON)));
            }
            if score > 0.0 {
                scored.push(Self::candidate(record, score));
            }
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

    async fn filtered_scan(
        &self,
        filter: &ScanFilter,
        order_by: Option<&str>,
        k: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let chunks = self.chunks.read().unwrap();
        let mut matched: Vec<Candidate> = chunks
            .values()
            .filter(|record| {
                Self::matches(record, Some(&filter.equals))
                    && (filter.resource_types.is_empty()
                        || filter
                            .resource_types
                            .iter()
                            .any(|t| *t == record.metadata.resource_type))
            })
            .map(|record| Self::candidate(record, 0.0))
            .collect();

        if let Some(key) = order_by {
            matched.sort_by(|a, b| {
                let av = a.metadata.get(key);
                let bv = b.metadata.get(key);
                // Descending with missing values last.
                match (av, bv) {
                    (Some(x), Some(y)) => y.cmp(&x),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
                .then(a.chunk_id.cmp(&b.chunk_id))
            });
        }
        matched.truncate(k);
        Ok(matched)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            chunk_count: self.len() as u64,
            ..StoreStats::default()
        })
    }
}
