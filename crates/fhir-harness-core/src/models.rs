//! Core data models used throughout FHIR Harness.
//!
//! These types represent the submissions, chunks, and failure records that
//! flow through the ingestion and retrieval pipeline. The data lifecycle is:
//!
//! ```text
//! Parser → ResourceSubmission → validate() → enqueue → chunk() → [text]
//!                                                          ↓
//!                                               extract_metadata() + embed()
//!                                                          ↓
//!                                               ChunkRecord → upsert_batch()
//!                                                          ↓
//!                                               search() → Candidate
//! ```
//!
//! A submission that terminally fails ingestion leaves a [`DeadLetterRecord`]
//! as its only trace; everything else about it is discarded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One inbound clinical resource, as handed over by the raw-file parser.
///
/// Serialized verbatim into the ingestion journal, so the queue can replay
/// it after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSubmission {
    /// Stable resource identifier, unique across the active store.
    pub resource_id: String,
    /// The `fullUrl` of the bundle entry this resource came from.
    pub full_url: String,
    /// FHIR resource type tag (e.g. `"Observation"`). Unrecognized values
    /// are accepted and treated as generic.
    pub resource_type: String,
    /// Human-readable text for the resource. Must be non-empty after trim.
    pub content: String,
    /// The raw resource JSON. Must parse as JSON.
    pub resource_json: String,
    /// Patient this resource belongs to, when known.
    pub patient_id: Option<String>,
    /// Source file the resource was parsed from, when known.
    pub source_file: Option<String>,
}

/// Structured metadata attached to every persisted chunk.
///
/// Keys mirror the filterable metadata document stored next to each chunk.
/// Missing dates are omitted rather than stored as null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    pub resource_id: String,
    pub resource_type: String,
    pub full_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    pub chunk_id: String,
    /// 0-based position of this chunk within its resource.
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Chunk text length in characters.
    pub chunk_size: usize,
    /// ISO-8601 date derived from the resource, when the resource type has
    /// a recognized date field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl ChunkMetadata {
    /// Look up a metadata key by name, stringifying numeric fields.
    ///
    /// Used by equality filters; unknown keys return `None`.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "patient_id" => self.patient_id.clone(),
            "resource_id" => Some(self.resource_id.clone()),
            "resource_type" => Some(self.resource_type.clone()),
            "full_url" => Some(self.full_url.clone()),
            "source_file" => self.source_file.clone(),
            "chunk_id" => Some(self.chunk_id.clone()),
            "chunk_index" => Some(self.chunk_index.to_string()),
            "total_chunks" => Some(self.total_chunks.to_string()),
            "chunk_size" => Some(self.chunk_size.to_string()),
            "effective_date" => self.effective_date.clone(),
            "status" => self.status.clone(),
            "last_updated" => self.last_updated.clone(),
            _ => None,
        }
    }
}

/// A persisted, independently retrievable fragment of one resource.
///
/// `chunk_id` is `{resource_id}_chunk_{index}` and is globally unique;
/// re-ingesting the same resource overwrites by `chunk_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub resource_id: String,
    pub content: String,
    /// Dense embedding of `content`, fixed dimension per deployment.
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A chunk returned from a search or scan, with the backend's raw score.
///
/// Timeline scans carry a score of `0.0`; the HTTP layer drops the field
/// for responses that are defined without one.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub chunk_id: String,
    pub resource_id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f64,
}

/// Equality filter over chunk metadata keys.
///
/// A `BTreeMap` keeps iteration order deterministic, which keeps generated
/// SQL and cache fingerprints stable for identical filters.
pub type MetadataFilter = BTreeMap<String, String>;

/// Filter for [`filtered_scan`](crate::store::VectorStore::filtered_scan):
/// exact equality plus an optional resource-type membership set.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub equals: MetadataFilter,
    /// When non-empty, only chunks whose `resource_type` is in this set match.
    pub resource_types: Vec<String>,
}

/// Closed classification of everything that can go wrong with a work item.
///
/// The queue maps typed store and provider errors onto this set exactly
/// once, at the driver boundary; nothing matches on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Structurally invalid input. Terminal.
    Validation,
    /// Transient failure (network, timeout, rate limit, pool exhaustion).
    Retryable,
    /// The store already holds these chunks. Treated as success.
    Duplicate,
    /// Schema violation or programming error. Terminal.
    Fatal,
    /// A retryable error that exhausted its attempts. Terminal.
    MaxRetries,
    /// Backpressure signal from a full queue; never enters the journal.
    QueueFull,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Retryable => "retryable",
            ErrorClass::Duplicate => "duplicate",
            ErrorClass::Fatal => "fatal",
            ErrorClass::MaxRetries => "max_retries",
            ErrorClass::QueueFull => "queue_full",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a submission that terminally failed ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// First chunk id of the failed item, when chunking got that far.
    pub chunk_id: Option<String>,
    pub resource_id: String,
    pub error_class: ErrorClass,
    pub error_message: String,
    pub retry_count: u32,
    /// Unix epoch seconds of the first and most recent failure.
    pub first_seen: i64,
    pub last_seen: i64,
    /// Submission metadata captured at failure time, as a JSON document.
    pub metadata: Option<serde_json::Value>,
}

/// Build the canonical chunk id for a resource and chunk position.
pub fn chunk_id(resource_id: &str, index: usize) -> String {
    format!("{}_chunk_{}", resource_id, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(chunk_id("obs-1", 0), "obs-1_chunk_0");
        assert_eq!(chunk_id("obs-1", 12), "obs-1_chunk_12");
    }

    #[test]
    fn test_metadata_get_stringifies_numbers() {
        let meta = ChunkMetadata {
            patient_id: Some("p-1".into()),
            resource_id: "obs-1".into(),
            resource_type: "Observation".into(),
            full_url: "urn:uuid:abc".into(),
            source_file: None,
            chunk_id: "obs-1_chunk_0".into(),
            chunk_index: 0,
            total_chunks: 3,
            chunk_size: 42,
            effective_date: Some("2024-01-15".into()),
            status: None,
            last_updated: None,
        };
        assert_eq!(meta.get("chunk_index").as_deref(), Some("0"));
        assert_eq!(meta.get("total_chunks").as_deref(), Some("3"));
        assert_eq!(meta.get("patient_id").as_deref(), Some("p-1"));
        assert_eq!(meta.get("status"), None);
        assert_eq!(meta.get("no_such_key"), None);
    }

    #[test]
    fn test_metadata_serializes_without_missing_dates() {
        let meta = ChunkMetadata {
            patient_id: None,
            resource_id: "c-1".into(),
            resource_type: "Condition".into(),
            full_url: "urn:uuid:def".into(),
            source_file: None,
            chunk_id: "c-1_chunk_0".into(),
            chunk_index: 0,
            total_chunks: 1,
            chunk_size: 10,
            effective_date: None,
            status: None,
            last_updated: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("effective_date").is_none());
        assert!(json.get("patient_id").is_none());
        assert_eq!(json["resource_type"], "Condition");
    }
}
