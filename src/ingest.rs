//! Bundle ingestion command.
//!
//! `fhx ingest <bundle.json>` reads a FHIR Bundle, converts each entry
//! into a resource submission, and feeds the normal validate-and-enqueue
//! path. The command waits for the queue to drain and prints a summary, so
//! batch loads behave like the HTTP path, dead-letter handling included.
//!
//! The human-readable content for each resource is its narrative
//! (`text.div` with markup stripped) when present, otherwise the compact
//! resource JSON.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use fhir_harness_core::models::ResourceSubmission;

use crate::queue::{IngestQueue, SubmitError};

/// Outcome counters for one bundle ingest run.
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub submitted: usize,
    pub rejected: usize,
    pub skipped: usize,
}

/// Parse a bundle file and submit every entry to the queue.
pub async fn ingest_bundle(
    queue: &IngestQueue,
    path: &Path,
    drain_timeout: Duration,
) -> Result<IngestSummary> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bundle file: {}", path.display()))?;
    let bundle: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Bundle is not valid JSON: {}", path.display()))?;

    let entries = match bundle.get("entry").and_then(Value::as_array) {
        Some(entries) => entries,
        None => bail!("Bundle has no entry array: {}", path.display()),
    };

    let source_file = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string());

    let mut summary = IngestSummary::default();
    for entry in entries {
        let Some(submission) = submission_from_entry(entry, source_file.clone()) else {
            summary.skipped += 1;
            continue;
        };
        // Bounded local load: on backpressure, wait for queue room instead
        // of dropping the entry.
        let mut attempts = 0;
        loop {
            match queue.submit(submission.clone()).await {
                Ok(()) => {
                    summary.submitted += 1;
                    break;
                }
                Err(SubmitError::Validation(_)) => {
                    summary.rejected += 1;
                    break;
                }
                Err(SubmitError::QueueFull) if attempts < 100 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(SubmitError::QueueFull) => {
                    summary.rejected += 1;
                    break;
                }
                Err(SubmitError::Journal(e)) => bail!("journal failure during ingest: {}", e),
            }
        }
    }

    queue.wait_idle(drain_timeout).await?;
    Ok(summary)
}

/// Build a submission from one bundle entry; `None` when the entry has no
/// usable resource or id.
fn submission_from_entry(entry: &Value, source_file: Option<String>) -> Option<ResourceSubmission> {
    let resource = entry.get("resource")?;
    let resource_id = resource.get("id").and_then(Value::as_str)?.to_string();
    let resource_type = resource
        .get("resourceType")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();
    let full_url = entry
        .get("fullUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("urn:uuid:{}", resource_id));

    let resource_json = serde_json::to_string(resource).ok()?;
    let content = narrative(resource).unwrap_or_else(|| resource_json.clone());

    Some(ResourceSubmission {
        patient_id: patient_reference(resource, &resource_type, &resource_id),
        resource_id,
        full_url,
        resource_type,
        content,
        resource_json,
        source_file,
    })
}

/// Extract the narrative text of a resource, markup stripped.
fn narrative(resource: &Value) -> Option<String> {
    let div = resource.get("text")?.get("div")?.as_str()?;
    let stripped = strip_markup(div);
    if stripped.trim().is_empty() {
        None
    } else {
        Some(stripped)
    }
}

/// Drop XHTML tags and collapse whitespace.
fn strip_markup(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve the patient a resource belongs to.
///
/// Patient resources reference themselves; everything else carries a
/// `subject` or `patient` reference like `Patient/p-1` or `urn:uuid:p-1`.
fn patient_reference(resource: &Value, resource_type: &str, resource_id: &str) -> Option<String> {
    if resource_type == "Patient" {
        return Some(resource_id.to_string());
    }
    let reference = resource
        .get("subject")
        .or_else(|| resource.get("patient"))?
        .get("reference")?
        .as_str()?;
    let id = reference
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(reference);
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_markup() {
        let div = r#"<div xmlns="http://www.w3.org/1999/xhtml"><p>Cholesterol <b>195</b> mg/dL</p></div>"#;
        assert_eq!(strip_markup(div), "Cholesterol 195 mg/dL");
    }

    #[test]
    fn test_submission_from_entry_with_narrative() {
        let entry = json!({
            "fullUrl": "urn:uuid:obs-1",
            "resource": {
                "resourceType": "Observation",
                "id": "obs-1",
                "subject": { "reference": "Patient/p-1" },
                "text": { "div": "<div>Total cholesterol 195 mg/dL</div>" },
                "effectiveDateTime": "2024-01-15"
            }
        });
        let sub = submission_from_entry(&entry, Some("bundle.json".into())).unwrap();
        assert_eq!(sub.resource_id, "obs-1");
        assert_eq!(sub.resource_type, "Observation");
        assert_eq!(sub.full_url, "urn:uuid:obs-1");
        assert_eq!(sub.content, "Total cholesterol 195 mg/dL");
        assert_eq!(sub.patient_id.as_deref(), Some("p-1"));
        assert_eq!(sub.source_file.as_deref(), Some("bundle.json"));
    }

    #[test]
    fn test_submission_without_narrative_uses_json() {
        let entry = json!({
            "resource": { "resourceType": "Observation", "id": "obs-2", "status": "final" }
        });
        let sub = submission_from_entry(&entry, None).unwrap();
        assert!(sub.content.contains("\"resourceType\":\"Observation\""));
        assert_eq!(sub.full_url, "urn:uuid:obs-2");
    }

    #[test]
    fn test_patient_resource_references_itself() {
        let resource = json!({ "resourceType": "Patient", "id": "p-9" });
        assert_eq!(
            patient_reference(&resource, "Patient", "p-9").as_deref(),
            Some("p-9")
        );
    }

    #[test]
    fn test_urn_reference_resolves() {
        let resource = json!({ "subject": { "reference": "urn:uuid:p-7" } });
        assert_eq!(
            patient_reference(&resource, "Condition", "c-1").as_deref(),
            Some("p-7")
        );
    }

    #[test]
    fn test_entry_without_id_is_skipped() {
        let entry = json!({ "resource": { "resourceType": "Observation" } });
        assert!(submission_from_entry(&entry, None).is_none());
    }
}
