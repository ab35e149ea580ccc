//! Resource-type-aware metadata extraction.
//!
//! Builds the filterable [`ChunkMetadata`] document for each chunk from the
//! parsed resource, the submission fields, and the chunk's position. The
//! date field consulted depends on the resource type; the first present
//! field wins and missing dates are omitted entirely.

use serde_json::Value;

use crate::models::{chunk_id, ChunkMetadata, ResourceSubmission};

/// Date-field candidates per resource type, in priority order.
///
/// Dotted paths descend into nested objects (`period.start`).
fn date_fields(resource_type: &str) -> &'static [&'static str] {
    match resource_type {
        "Observation" => &["effectiveDateTime", "issued"],
        "Condition" => &["onsetDateTime", "recordedDate"],
        "Procedure" => &["performedDateTime"],
        "MedicationRequest" => &["authoredOn"],
        "Immunization" => &["occurrenceDateTime"],
        "DiagnosticReport" => &["effectiveDateTime"],
        "Encounter" => &["period.start"],
        "Patient" => &["birthDate"],
        _ => &[],
    }
}

/// Extract the metadata record for one chunk of a submission.
pub fn extract_metadata(
    resource: &Value,
    submission: &ResourceSubmission,
    chunk_text: &str,
    chunk_index: usize,
    total_chunks: usize,
) -> ChunkMetadata {
    ChunkMetadata {
        patient_id: submission.patient_id.clone(),
        resource_id: submission.resource_id.clone(),
        resource_type: submission.resource_type.clone(),
        full_url: submission.full_url.clone(),
        source_file: submission.source_file.clone(),
        chunk_id: chunk_id(&submission.resource_id, chunk_index),
        chunk_index,
        total_chunks,
        chunk_size: chunk_text.chars().count(),
        effective_date: extract_date(resource, &submission.resource_type),
        status: string_field(resource, "status"),
        last_updated: resource
            .get("meta")
            .and_then(|m| m.get("lastUpdated"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Resolve the effective date for a resource, per the type's field table.
pub fn extract_date(resource: &Value, resource_type: &str) -> Option<String> {
    for path in date_fields(resource_type) {
        let mut node = resource;
        let mut found = true;
        for segment in path.split('.') {
            match node.get(segment) {
                Some(next) => node = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(s) = node.as_str() {
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

fn string_field(resource: &Value, field: &str) -> Option<String> {
    resource.get(field).and_then(Value::as_str).map(str::to_string)
}
