//! Hybrid rank fusion and query-driven resource-type detection.
//!
//! The fusion algorithm merges one sparse (BM25) and one dense (cosine)
//! candidate list into a single deterministic ranking:
//!
//! 1. Normalize sparse scores to `[0, 1]` by dividing by the set maximum
//!    (a max of zero maps every score to zero).
//! 2. Normalize dense scores by rank: the top candidate gets `1.0` and
//!    candidate `i` of `n` gets `1 − i/n`. Rank normalization is robust to
//!    similarity scale drift across embedding models.
//! 3. Merge by `chunk_id`; a side that missed a chunk contributes `0`.
//! 4. Combined score = `w_sparse · sparse_norm + w_dense · dense_norm`.
//! 5. Sort descending; ties break on the sparse-normalized score, then on
//!    `chunk_id` ascending, so identical inputs always produce identical
//!    output order.

use std::collections::HashMap;

use crate::models::Candidate;

/// Weights for combining the two normalized rankings.
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub sparse: f64,
    pub dense: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            sparse: 0.5,
            dense: 0.5,
        }
    }
}

/// Fuse sparse and dense candidate lists into the top `k` ranked chunks.
///
/// Input lists must be ordered best-first, as returned by the store. The
/// returned candidates carry the combined score.
pub fn fuse_hybrid(
    sparse: Vec<Candidate>,
    dense: Vec<Candidate>,
    weights: HybridWeights,
    k: usize,
) -> Vec<Candidate> {
    let max_sparse = sparse
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);

    let sparse_norm: HashMap<String, f64> = sparse
        .iter()
        .map(|c| {
            let norm = if max_sparse > 0.0 {
                c.score / max_sparse
            } else {
                0.0
            };
            (c.chunk_id.clone(), norm)
        })
        .collect();

    let n = dense.len();
    let dense_norm: HashMap<String, f64> = dense
        .iter()
        .enumerate()
        .map(|(i, c)| (c.chunk_id.clone(), 1.0 - i as f64 / n as f64))
        .collect();

    let mut merged: HashMap<String, Candidate> = HashMap::new();
    for c in dense.into_iter().chain(sparse.into_iter()) {
        merged.entry(c.chunk_id.clone()).or_insert(c);
    }

    struct Fused {
        candidate: Candidate,
        sparse: f64,
    }

    let mut fused: Vec<Fused> = merged
        .into_values()
        .map(|mut candidate| {
            let s = sparse_norm.get(&candidate.chunk_id).copied().unwrap_or(0.0);
            let d = dense_norm.get(&candidate.chunk_id).copied().unwrap_or(0.0);
            candidate.score = weights.sparse * s + weights.dense * d;
            Fused {
                candidate,
                sparse: s,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.candidate
            .score
            .partial_cmp(&a.candidate.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.sparse
                    .partial_cmp(&a.sparse)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.candidate.chunk_id.cmp(&b.candidate.chunk_id))
    });

    fused.truncate(k);
    fused.into_iter().map(|f| f.candidate).collect()
}

/// Keyword-to-resource-type map consulted on dense and hybrid queries when
/// the caller did not pass an explicit `resource_type` filter. The first
/// matching type wins; matching is whole-word over the lowercased query.
const TYPE_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "Condition",
        &["condition", "diagnosis", "disease", "problem", "illness", "disorder"],
    ),
    (
        "Observation",
        &["lab", "test", "vital", "blood pressure", "glucose", "cholesterol"],
    ),
    (
        "MedicationRequest",
        &["medication", "drug", "prescription", "rx"],
    ),
    (
        "Procedure",
        &["surgery", "surgical", "operation", "intervention"],
    ),
    ("Immunization", &["vaccine", "vaccination", "immunized"]),
    (
        "Encounter",
        &["visit", "appointment", "admission", "hospitalization"],
    ),
    (
        "DiagnosticReport",
        &["imaging", "radiology", "xray", "mri", "ct scan"],
    ),
];

/// Infer a resource-type filter from query keywords.
///
/// Returns the first type whose keyword list matches a whole word (or a
/// whole multi-word phrase) of the query; `None` when nothing matches.
pub fn detect_resource_type(query: &str) -> Option<&'static str> {
    let normalized: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let padded = format!(" {} ", normalized.split_whitespace().collect::<Vec<_>>().join(" "));

    for (resource_type, keywords) in TYPE_KEYWORDS {
        for keyword in *keywords {
            if padded.contains(&format!(" {} ", keyword)) {
                return Some(resource_type);
            }
        }
    }
    None
}
