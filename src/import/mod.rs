//! JSONL Import Pipeline (spec §4.5).
//!
//! Accepts either an inline array of raw span objects or a filesystem
//! path to a newline-delimited JSON file, and funnels each record
//! through the same normalize/derive path as the OTLP ingest pipeline.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use crate::core::constants::IMPORT_MAX_LINE_BYTES;
use crate::domain::{Span, SpanAttribute, SpanLink, StatusCode};
use crate::error::ApiError;
use crate::normalize;
use crate::store::{ConversationDelta, IngestBatch};

/// `POST /api/spans/import` body: either an inline array of span objects
/// or a path to a JSONL file (spec §4.5, §6).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ImportRequest {
    Path { path: String },
    Spans { spans: Vec<JsonValue> },
}

/// Confines `path` to the process's working directory (spec §4.5:
/// "relative paths are prefixed with `./`... confined to the working
/// directory").
fn confine_path(path: &str) -> Result<PathBuf, ApiError> {
    let cwd = std::env::current_dir()
        .map_err(|e| ApiError::bad_request(format!("cannot resolve working directory: {e}")))?;

    let candidate = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        cwd.join(path.trim_start_matches("./"))
    };

    let canonical = candidate
        .canonicalize()
        .map_err(|e| ApiError::bad_request(format!("invalid import path: {e}")))?;

    if !canonical.starts_with(&cwd) {
        return Err(ApiError::bad_request("import path escapes working directory"));
    }

    Ok(canonical)
}

fn parse_nanos(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

fn parse_status_code(value: Option<&str>) -> StatusCode {
    match value {
        Some("OK") => StatusCode::Ok,
        Some("ERROR") => StatusCode::Error,
        _ => StatusCode::Unset,
    }
}

struct TransformedJsonSpan {
    span: Span,
    attributes: Vec<SpanAttribute>,
    links: Vec<SpanLink>,
    conversation_id: String,
    model: Option<String>,
}

/// Maps one raw JSONL span object through normalize/derive (spec §4.5:
/// "remaining processing is identical to §4.3"). Returns `None` when a
/// required field (`name`, `trace_id`, `span_id`) is missing — the caller
/// skips the record with a warning rather than failing the whole import.
fn transform_record(value: &JsonValue) -> Option<TransformedJsonSpan> {
    let name = value.get("name")?.as_str()?.to_string();
    let trace_id = value.get("trace_id")?.as_str()?.to_string();
    let span_id = value.get("span_id")?.as_str()?.to_string();
    let parent_span_id = value
        .get("parent_span_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let start_time_unix_nano = parse_nanos(value.get("start_time")).unwrap_or(0);
    let end_time_unix_nano = parse_nanos(value.get("end_time")).unwrap_or(start_time_unix_nano);

    let status_code = parse_status_code(
        value
            .pointer("/status/status_code")
            .and_then(|v| v.as_str()),
    );
    let status_description = value
        .pointer("/status/description")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut attrs: Map<String, JsonValue> = value
        .get("attributes")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    attrs.insert("span.name".to_string(), JsonValue::String(name.clone()));
    attrs.insert(
        "span.kind".to_string(),
        JsonValue::String(
            value
                .get("kind")
                .and_then(|v| v.as_str())
                .unwrap_or("UNSPECIFIED")
                .to_string(),
        ),
    );
    attrs.insert("trace.id".to_string(), JsonValue::String(trace_id.clone()));
    attrs.insert("span.id".to_string(), JsonValue::String(span_id.clone()));
    attrs.insert(
        "span.status.code".to_string(),
        JsonValue::String(status_code.as_str().to_string()),
    );
    if let Some(desc) = &status_description {
        attrs.insert("span.status.description".to_string(), JsonValue::String(desc.clone()));
    }

    let events = value
        .get("events")
        .cloned()
        .unwrap_or_else(|| JsonValue::Array(Vec::new()));
    attrs.insert("span.events".to_string(), events.clone());

    normalize::augment_vendor_json(&mut attrs);
    let model = normalize::derive_model(&attrs);
    if let Some(ref m) = model {
        attrs.entry("st.model".to_string()).or_insert_with(|| JsonValue::String(m.clone()));
    }
    let category = normalize::categorize_span(&name, &attrs);
    attrs
        .entry("st.category".to_string())
        .or_insert_with(|| JsonValue::String(category.to_string()));

    let flattened = normalize::flatten(&attrs);
    let attribute_values: Vec<(String, crate::domain::AttrValue)> = flattened
        .iter()
        .map(|(k, v)| (k.clone(), normalize::classify(v)))
        .collect();

    let conversation_id = normalize::derive_conversation_key(&attribute_values, &trace_id);

    let span_attributes = attribute_values
        .into_iter()
        .map(|(key, value)| SpanAttribute {
            span_id: span_id.clone(),
            trace_id: trace_id.clone(),
            key,
            value,
        })
        .collect();

    let links = value
        .get("links")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|l| {
                    let linked_trace_id = l.get("trace_id")?.as_str()?.to_string();
                    let linked_span_id = l
                        .get("span_id")
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                    Some(SpanLink {
                        span_id: span_id.clone(),
                        trace_id: trace_id.clone(),
                        linked_trace_id,
                        linked_span_id,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(TransformedJsonSpan {
        span: Span {
            span_id,
            trace_id,
            parent_span_id,
            name,
            start_time_unix_nano,
            end_time_unix_nano,
            status_code,
            status_description,
            attributes_json: JsonValue::Object(attrs),
            events_json: events,
        },
        attributes: span_attributes,
        links,
        conversation_id,
        model,
    })
}

/// Folds a sequence of raw span objects into an `IngestBatch`, skipping
/// and logging (spec §7: "per-record failures during JSONL import are
/// logged at warn and skipped") any record missing a required field.
fn build_batch(records: impl Iterator<Item = JsonValue>) -> IngestBatch {
    let mut batch = IngestBatch::default();
    let mut deltas: std::collections::BTreeMap<String, (i64, i64, Option<String>)> =
        std::collections::BTreeMap::new();
    let mut trace_conversations: std::collections::BTreeMap<String, String> =
        std::collections::BTreeMap::new();
    let mut span_ids_by_conversation: std::collections::BTreeMap<String, Vec<String>> =
        std::collections::BTreeMap::new();

    for record in records {
        let Some(transformed) = transform_record(&record) else {
            tracing::warn!("skipping JSONL record missing a required field");
            continue;
        };

        let entry = deltas
            .entry(transformed.conversation_id.clone())
            .or_insert_with(|| {
                (
                    transformed.span.start_time_unix_nano,
                    transformed.span.end_time_unix_nano,
                    None,
                )
            });
        entry.0 = entry.0.min(transformed.span.start_time_unix_nano);
        entry.1 = entry.1.max(transformed.span.end_time_unix_nano);
        if entry.2.is_none() {
            entry.2 = transformed.model.clone();
        }

        span_ids_by_conversation
            .entry(transformed.conversation_id.clone())
            .or_default()
            .push(transformed.span.span_id.clone());

        trace_conversations
            .entry(transformed.span.trace_id.clone())
            .or_insert_with(|| transformed.conversation_id.clone());

        batch.spans.push(transformed.span);
        batch.attributes.extend(transformed.attributes);
        batch.links.extend(transformed.links);
    }

    batch.conversation_deltas = deltas
        .into_iter()
        .map(|(conversation_id, (first_start_time, last_end_time, model))| ConversationDelta {
            span_ids: span_ids_by_conversation.remove(&conversation_id).unwrap_or_default(),
            conversation_id,
            first_start_time,
            last_end_time,
            model,
        })
        .collect();
    batch.trace_conversation_ids = trace_conversations.into_iter().collect();

    batch
}

/// Reads and decodes a JSONL file into an `IngestBatch` (spec §4.5).
/// File-level I/O or UTF-8 errors abort with 400; malformed individual
/// lines are skipped.
async fn import_from_path(path: &str) -> Result<IngestBatch, ApiError> {
    let confined = confine_path(path)?;
    let bytes = tokio::fs::read(&confined)
        .await
        .map_err(|e| ApiError::bad_request(format!("cannot read import file: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| ApiError::bad_request("import file is not valid UTF-8"))?;

    let records = text.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line.len() > IMPORT_MAX_LINE_BYTES {
            tracing::warn!(bytes = line.len(), "skipping oversized JSONL line");
            return None;
        }
        match serde_json::from_str::<JsonValue>(line) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed JSONL line");
                None
            }
        }
    });

    Ok(build_batch(records))
}

/// Builds an `IngestBatch` from an `ImportRequest` (spec §4.5, §6).
pub async fn process(request: ImportRequest) -> Result<IngestBatch, ApiError> {
    match request {
        ImportRequest::Path { path } => import_from_path(&path).await,
        ImportRequest::Spans { spans } => Ok(build_batch(spans.into_iter())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transform_record_skips_missing_required_fields() {
        assert!(transform_record(&json!({"name": "op"})).is_none());
        assert!(transform_record(&json!({"trace_id": "T1", "span_id": "S1"})).is_none());
    }

    #[test]
    fn test_transform_record_builds_span_and_derives_conversation() {
        let record = json!({
            "name": "chat",
            "trace_id": "T1",
            "span_id": "S1",
            "start_time": 100,
            "end_time": 300,
            "attributes": {"gen_ai.conversation.id": "conv-A", "gen_ai.request.model": "gpt-4"}
        });
        let t = transform_record(&record).unwrap();
        assert_eq!(t.conversation_id, "conv-A");
        assert_eq!(t.model.as_deref(), Some("gpt-4"));
        assert_eq!(t.span.duration_ms(), 0);
        assert_eq!(t.span.status_code, StatusCode::Unset);
    }

    #[test]
    fn test_transform_record_falls_back_to_trace_id() {
        let record = json!({"name": "op", "trace_id": "T9", "span_id": "S1"});
        let t = transform_record(&record).unwrap();
        assert_eq!(t.conversation_id, "T9");
    }

    #[test]
    fn test_transform_record_parses_decimal_string_timestamps() {
        let record = json!({
            "name": "op", "trace_id": "T1", "span_id": "S1",
            "start_time": "100", "end_time": "300"
        });
        let t = transform_record(&record).unwrap();
        assert_eq!(t.span.start_time_unix_nano, 100);
        assert_eq!(t.span.end_time_unix_nano, 300);
    }

    #[test]
    fn test_transform_record_status_code_and_description() {
        let record = json!({
            "name": "op", "trace_id": "T1", "span_id": "S1",
            "status": {"status_code": "ERROR", "description": "boom"}
        });
        let t = transform_record(&record).unwrap();
        assert_eq!(t.span.status_code, StatusCode::Error);
        assert_eq!(t.span.status_description.as_deref(), Some("boom"));
    }

    #[test]
    fn test_build_batch_skips_invalid_and_keeps_valid() {
        let records = vec![
            json!({"name": "ok", "trace_id": "T1", "span_id": "S1"}),
            json!({"name": "missing ids"}),
        ];
        let batch = build_batch(records.into_iter());
        assert_eq!(batch.spans.len(), 1);
        assert_eq!(batch.conversation_deltas.len(), 1);
    }

    #[test]
    fn test_build_batch_merges_deltas_across_records() {
        let records = vec![
            json!({
                "name": "a", "trace_id": "T1", "span_id": "S1", "start_time": 100, "end_time": 200,
                "attributes": {"conversation_id": "conv-A"}
            }),
            json!({
                "name": "b", "trace_id": "T2", "span_id": "S2", "start_time": 50, "end_time": 500,
                "attributes": {"conversation_id": "conv-A"}
            }),
        ];
        let batch = build_batch(records.into_iter());
        assert_eq!(batch.conversation_deltas.len(), 1);
        let delta = &batch.conversation_deltas[0];
        assert_eq!(delta.first_start_time, 50);
        assert_eq!(delta.last_end_time, 500);
        assert_eq!(delta.span_ids.len(), 2);
    }

    #[test]
    fn test_confine_path_rejects_escape() {
        let result = confine_path("../../etc/passwd");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_import_from_path_reads_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let original_cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let file_path = dir.path().join("spans.jsonl");
        tokio::fs::write(
            &file_path,
            "{\"name\":\"a\",\"trace_id\":\"T1\",\"span_id\":\"S1\"}\nnot json\n",
        )
        .await
        .unwrap();

        let batch = import_from_path("spans.jsonl").await.unwrap();
        std::env::set_current_dir(original_cwd).unwrap();

        assert_eq!(batch.spans.len(), 1);
    }
}
