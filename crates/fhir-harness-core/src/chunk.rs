//! JSON-aware resource chunker.
//!
//! Splits one clinical resource into ordered chunk texts bounded by the
//! configured character limits. The preferred strategy splits the resource
//! JSON tree at object/array boundaries so that every emitted fragment is
//! independently parseable JSON; when a fragment cannot be reduced that way
//! (a single oversized string value, or unparseable input), the chunker
//! falls back to plain character splitting of the human-readable content
//! with a fixed overlap.
//!
//! # Algorithm
//!
//! 1. If both the resource JSON and the human-readable content fit within
//!    `max_chars`, emit a single chunk holding the content. Small resources
//!    are retrieved through their narrative, not their raw JSON.
//! 2. Otherwise walk the JSON tree: greedily pack object members (or array
//!    elements) into fragments whose compact serialization stays under
//!    `max_chars`. An oversized member is recursed into, and its pieces are
//!    re-wrapped under the member key so each piece still parses.
//! 3. A scalar that alone exceeds `max_chars` cannot be reduced; the whole
//!    resource falls back to character splitting of the content with
//!    `overlap_chars` of carry-over between consecutive chunks.
//!
//! # Guarantees
//!
//! - At least one chunk is always returned.
//! - Identical input and identical limits produce identical chunks.
//! - Chunk order is the emission order and becomes `chunk_index`.

use serde_json::Value;

/// Character limits for chunking.
#[derive(Debug, Clone)]
pub struct ChunkLimits {
    /// Soft lower bound; respected where the JSON structure allows it.
    pub min_chars: usize,
    /// Hard upper bound for every chunk except fallback remainders.
    pub max_chars: usize,
    /// Carry-over between consecutive chunks, fallback strategy only.
    pub overlap_chars: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            min_chars: 500,
            max_chars: 1000,
            overlap_chars: 200,
        }
    }
}

/// Split a resource into ordered chunk texts.
///
/// `resource_json` drives the preferred JSON-tree strategy; `content` is
/// the human-readable text used for small resources and for the character
/// fallback.
pub fn chunk_resource(resource_json: &str, content: &str, limits: &ChunkLimits) -> Vec<String> {
    let narrative = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(resource_json) {
        if resource_json.trim().len() <= limits.max_chars
            && narrative.chars().count() <= limits.max_chars
        {
            return vec![narrative.to_string()];
        }
        if let Some(fragments) = split_json(&value, limits.max_chars) {
            return fragments;
        }
    }

    split_chars(narrative, limits.max_chars, limits.overlap_chars)
}

/// Recursively split a JSON value into parseable fragments of at most
/// `max` characters. Returns `None` when some scalar cannot be reduced
/// below the budget, signalling the caller to fall back.
fn split_json(value: &Value, max: usize) -> Option<Vec<String>> {
    let serialized = compact(value);
    if serialized.chars().count() <= max {
        return Some(vec![serialized]);
    }

    match value {
        Value::Object(map) => {
            let mut out = Vec::new();
            let mut group = serde_json::Map::new();
            let mut group_len = 2usize; // "{}"

            for (key, member) in map {
                let key_ser = compact(&Value::String(key.clone()));
                let member_ser = compact(member);
                let pair_len = key_ser.chars().count() + 1 + member_ser.chars().count();

                if pair_len + 2 > max {
                    // Member alone blows the budget: flush the running group,
                    // split the member and re-wrap each piece under its key.
                    flush_object(&mut out, &mut group, &mut group_len);
                    let wrapper = key_ser.chars().count() + 3; // {"key": ... }
                    let budget = max.checked_sub(wrapper)?;
                    for piece in split_json(member, budget)? {
                        out.push(format!("{{{}:{}}}", key_ser, piece));
                    }
                    continue;
                }

                let added = pair_len + if group.is_empty() { 0 } else { 1 };
                if group_len + added > max {
                    flush_object(&mut out, &mut group, &mut group_len);
                }
                group_len += pair_len + if group.is_empty() { 0 } else { 1 };
                group.insert(key.clone(), member.clone());
            }
            flush_object(&mut out, &mut group, &mut group_len);
            Some(out)
        }
        Value::Array(items) => {
            let mut out = Vec::new();
            let mut group: Vec<Value> = Vec::new();
            let mut group_len = 2usize; // "[]"

            for item in items {
                let item_len = compact(item).chars().count();

                if item_len + 2 > max {
                    flush_array(&mut out, &mut group, &mut group_len);
                    out.extend(split_json(item, max)?);
                    continue;
                }

                let added = item_len + if group.is_empty() { 0 } else { 1 };
                if group_len + added > max {
                    flush_array(&mut out, &mut group, &mut group_len);
                }
                group_len += item_len + if group.is_empty() { 0 } else { 1 };
                group.push(item.clone());
            }
            flush_array(&mut out, &mut group, &mut group_len);
            Some(out)
        }
        // A scalar over budget cannot be made smaller while staying JSON.
        _ => None,
    }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn flush_object(out: &mut Vec<String>, group: &mut serde_json::Map<String, Value>, len: &mut usize) {
    if !group.is_empty() {
        out.push(compact(&Value::Object(std::mem::take(group))));
        *len = 2;
    }
}

fn flush_array(out: &mut Vec<String>, group: &mut Vec<Value>, len: &mut usize) {
    if !group.is_empty() {
        out.push(compact(&Value::Array(std::mem::take(group))));
        *len = 2;
    }
}

/// Character-window fallback with overlap. Windows advance by
/// `max_chars − overlap` so consecutive chunks share `overlap` characters.
fn split_chars(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    let step = max_chars.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(min: usize, max: usize, overlap: usize) -> ChunkLimits {
        ChunkLimits {
            min_chars: min,
            max_chars: max,
            overlap_chars: overlap,
        }
    }

    #[test]
    fn test_small_resource_single_narrative_chunk() {
        let json = r#"{"resourceType":"Observation","id":"obs-1","status":"final"}"#;
        let content = "Cholesterol total 195 mg/dL on 2024-01-15";
        let chunks = chunk_resource(json, content, &ChunkLimits::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], content);
    }

    #[test]
    fn test_large_json_fragments_parse_independently() {
        let entries: Vec<String> = (0..40)
            .map(|i| format!(r#"{{"system":"http://loinc.org","code":"code-{}","display":"Component number {} with a reasonably long display string"}}"#, i, i))
            .collect();
        let json = format!(
            r#"{{"resourceType":"DiagnosticReport","id":"rep-1","result":[{}]}}"#,
            entries.join(",")
        );
        let chunks = chunk_resource(&json, "report narrative", &limits(500, 1000, 200));

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1000, "oversized chunk: {}", chunk.len());
            serde_json::from_str::<Value>(chunk).expect("chunk must parse as JSON");
        }
    }

    #[test]
    fn test_chunk_count_tracks_size() {
        // Uniform array elements pack greedily, so the chunk count stays
        // near ceil(total / max).
        let entries: Vec<String> = (0..30)
            .map(|i| format!(r#"{{"v":"padding padding padding padding padding {:04}"}}"#, i))
            .collect();
        let json = format!(r#"{{"rows":[{}]}}"#, entries.join(","));
        let total = json.len();
        let chunks = chunk_resource(&json, "n/a", &limits(500, 1000, 200));
        let ceiling = total / 1000 + 2;
        assert!(chunks.len() <= ceiling, "{} chunks for {} chars", chunks.len(), total);
    }

    #[test]
    fn test_unsplittable_scalar_falls_back_with_overlap() {
        let long_value = "x".repeat(3000);
        let json = format!(r#"{{"resourceType":"Observation","note":"{}"}}"#, long_value);
        let content = format!("narrative {}", "word ".repeat(500));
        let chunks = chunk_resource(&json, &content, &limits(500, 1000, 200));

        assert!(chunks.len() > 1);
        let first: Vec<char> = chunks[0].chars().collect();
        let tail: String = first[first.len() - 200..].iter().collect();
        assert!(chunks[1].starts_with(&tail), "expected 200-char overlap");
    }

    #[test]
    fn test_deterministic() {
        let json = format!(
            r#"{{"resourceType":"Condition","evidence":[{}]}}"#,
            (0..50)
                .map(|i| format!(r#"{{"detail":"evidence item {} lorem ipsum dolor sit amet"}}"#, i))
                .collect::<Vec<_>>()
                .join(",")
        );
        let a = chunk_resource(&json, "narrative", &limits(500, 1000, 200));
        let b = chunk_resource(&json, "narrative", &limits(500, 1000, 200));
        assert_eq!(a, b);
    }

    #[test]
    fn test_unparseable_json_uses_content_fallback() {
        let content = "c".repeat(1500);
        let chunks = chunk_resource("not json at all", &content, &limits(500, 1000, 200));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 1000);
    }

    #[test]
    fn test_always_at_least_one_chunk() {
        let chunks = chunk_resource("{}", "", &ChunkLimits::default());
        assert_eq!(chunks.len(), 1);
    }
}
