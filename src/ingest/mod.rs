//! OTLP Ingest Pipeline (spec §4.3).
//!
//! Decodes a batched OTLP export request, converts each span into the
//! internal span record plus typed attribute rows, derives conversation
//! ids, and assembles one `store::IngestBatch` per request.

use std::collections::BTreeMap;

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value::Value as AnyValueInner, AnyValue, KeyValue};
use opentelemetry_proto::tonic::trace::v1::{span::SpanKind, status::StatusCode as OtlpStatusCode, ResourceSpans, Span as OtlpSpan};
use prost::Message;
use serde_json::{Map, Value as JsonValue};

use crate::domain::{nanos_to_rfc3339, AttrValue, Span, SpanAttribute, SpanLink, StatusCode};
use crate::normalize;
use crate::store::{ConversationDelta, IngestBatch};

/// Converts an OTLP `AnyValue` into a native-typed `serde_json::Value`,
/// preserving numeric/bool/array/map shape rather than stringifying it —
/// so the normalizer's type classification sees real JSON types.
pub fn any_value_to_json(value: &AnyValue) -> JsonValue {
    match &value.value {
        None => JsonValue::Null,
        Some(AnyValueInner::StringValue(s)) => JsonValue::String(s.clone()),
        Some(AnyValueInner::BoolValue(b)) => JsonValue::Bool(*b),
        Some(AnyValueInner::IntValue(i)) => JsonValue::from(*i),
        Some(AnyValueInner::DoubleValue(d)) => {
            serde_json::Number::from_f64(*d).map(JsonValue::Number).unwrap_or(JsonValue::Null)
        }
        Some(AnyValueInner::BytesValue(b)) => JsonValue::String(hex::encode(b)),
        Some(AnyValueInner::ArrayValue(arr)) => {
            JsonValue::Array(arr.values.iter().map(any_value_to_json).collect())
        }
        Some(AnyValueInner::KvlistValue(kvlist)) => {
            let mut map = Map::new();
            for kv in &kvlist.values {
                if let Some(v) = &kv.value {
                    map.insert(kv.key.clone(), any_value_to_json(v));
                }
            }
            JsonValue::Object(map)
        }
    }
}

fn key_values_to_map(kvs: &[KeyValue]) -> Map<String, JsonValue> {
    let mut map = Map::new();
    for kv in kvs {
        if let Some(v) = &kv.value {
            map.insert(kv.key.clone(), any_value_to_json(v));
        }
    }
    map
}

fn span_kind_to_string(kind: i32) -> &'static str {
    match SpanKind::try_from(kind).unwrap_or(SpanKind::Unspecified) {
        SpanKind::Internal => "INTERNAL",
        SpanKind::Server => "SERVER",
        SpanKind::Client => "CLIENT",
        SpanKind::Producer => "PRODUCER",
        SpanKind::Consumer => "CONSUMER",
        SpanKind::Unspecified => "UNSPECIFIED",
    }
}

fn status_code_to_domain(code: i32) -> StatusCode {
    match OtlpStatusCode::try_from(code).unwrap_or(OtlpStatusCode::Unset) {
        OtlpStatusCode::Ok => StatusCode::Ok,
        OtlpStatusCode::Error => StatusCode::Error,
        OtlpStatusCode::Unset => StatusCode::Unset,
    }
}

/// One fully-transformed span: the span row, its flattened typed
/// attributes, its links, and its derived conversation id.
struct TransformedSpan {
    span: Span,
    attributes: Vec<SpanAttribute>,
    links: Vec<SpanLink>,
    conversation_id: String,
    model: Option<String>,
}

fn transform_span(otlp_span: &OtlpSpan, resource_attrs: &Map<String, JsonValue>) -> TransformedSpan {
    let trace_id = hex::encode(&otlp_span.trace_id);
    let span_id = hex::encode(&otlp_span.span_id);
    let parent_span_id = if otlp_span.parent_span_id.is_empty() {
        None
    } else {
        Some(hex::encode(&otlp_span.parent_span_id))
    };

    let mut attrs = key_values_to_map(&otlp_span.attributes);

    // Merge resource attributes under `resource.<key>`, and promote each
    // to top-level when there is no conflict (spec §4.3).
    for (k, v) in resource_attrs {
        let prefixed = format!("resource.{k}");
        attrs.insert(prefixed, v.clone());
        attrs.entry(k.clone()).or_insert_with(|| v.clone());
    }

    // Synthetic keys (spec §4.3).
    attrs.insert("span.name".to_string(), JsonValue::String(otlp_span.name.clone()));
    attrs.insert(
        "span.kind".to_string(),
        JsonValue::String(span_kind_to_string(otlp_span.kind).to_string()),
    );
    attrs.insert("trace.id".to_string(), JsonValue::String(trace_id.clone()));
    attrs.insert("span.id".to_string(), JsonValue::String(span_id.clone()));

    let status_code = otlp_span.status.as_ref().map(|s| status_code_to_domain(s.code));
    let status_description = otlp_span
        .status
        .as_ref()
        .map(|s| s.message.clone())
        .filter(|m| !m.is_empty());

    if let Some(ref code) = status_code {
        attrs.insert(
            "span.status.code".to_string(),
            JsonValue::String(code.as_str().to_string()),
        );
        if let Some(desc) = &status_description {
            attrs.insert("span.status.description".to_string(), JsonValue::String(desc.clone()));
        }
    }

    // Events rendered as an ordered list under `span.events` (spec §4.3:
    // timestamp is RFC3339 nanos, not a raw decimal integer).
    let events: Vec<JsonValue> = otlp_span
        .events
        .iter()
        .map(|e| {
            serde_json::json!({
                "name": e.name,
                "timestamp": nanos_to_rfc3339(e.time_unix_nano as i64),
                "attributes": key_values_to_map(&e.attributes),
            })
        })
        .collect();
    attrs.insert("span.events".to_string(), JsonValue::Array(events.clone()));

    // Vendor augmentation happens before flattening (spec §4.1).
    normalize::augment_vendor_json(&mut attrs);
    let model = normalize::derive_model(&attrs);
    if let Some(ref m) = model {
        attrs.entry("st.model".to_string()).or_insert_with(|| JsonValue::String(m.clone()));
    }
    let category = normalize::categorize_span(&otlp_span.name, &attrs);
    attrs
        .entry("st.category".to_string())
        .or_insert_with(|| JsonValue::String(category.to_string()));

    let flattened = normalize::flatten(&attrs);
    let attribute_values: Vec<(String, AttrValue)> = flattened
        .iter()
        .map(|(k, v)| (k.clone(), normalize::classify(v)))
        .collect();

    let conversation_id = normalize::derive_conversation_key(&attribute_values, &trace_id);

    let span_attributes: Vec<SpanAttribute> = attribute_values
        .into_iter()
        .map(|(key, value)| SpanAttribute {
            span_id: span_id.clone(),
            trace_id: trace_id.clone(),
            key,
            value,
        })
        .collect();

    let links: Vec<SpanLink> = otlp_span
        .links
        .iter()
        .map(|l| SpanLink {
            span_id: span_id.clone(),
            trace_id: trace_id.clone(),
            linked_trace_id: hex::encode(&l.trace_id),
            linked_span_id: if l.span_id.is_empty() {
                None
            } else {
                Some(hex::encode(&l.span_id))
            },
        })
        .collect();

    TransformedSpan {
        span: Span {
            span_id,
            trace_id,
            parent_span_id,
            name: otlp_span.name.clone(),
            start_time_unix_nano: otlp_span.start_time_unix_nano as i64,
            end_time_unix_nano: otlp_span.end_time_unix_nano as i64,
            status_code: status_code.unwrap_or(StatusCode::Unset),
            status_description,
            attributes_json: JsonValue::Object(attrs),
            events_json: JsonValue::Array(events),
        },
        attributes: span_attributes,
        links,
        conversation_id,
        model,
    }
}

/// Builds an `IngestBatch` from a decoded OTLP export request (spec §4.3:
/// "a single request emits one batch each of span rows, typed-attribute
/// rows, and span-link rows, plus one conversation-aggregate upsert...
/// merged per key within the batch before store").
pub fn build_batch(request: &ExportTraceServiceRequest) -> IngestBatch {
    let mut batch = IngestBatch::default();

    // conversation_id -> (span_ids, first_start, last_end, model)
    let mut deltas: BTreeMap<String, (Vec<String>, i64, i64, Option<String>)> = BTreeMap::new();
    // trace_id -> conversation_id, for every trace that got a derived id in this batch.
    let mut trace_conversations: BTreeMap<String, String> = BTreeMap::new();

    for resource_spans in &request.resource_spans {
        let resource_attrs = resource_attrs(resource_spans);

        for scope_spans in &resource_spans.scope_spans {
            for otlp_span in &scope_spans.spans {
                let transformed = transform_span(otlp_span, &resource_attrs);

                let entry = deltas.entry(transformed.conversation_id.clone()).or_insert_with(|| {
                    (
                        Vec::new(),
                        transformed.span.start_time_unix_nano,
                        transformed.span.end_time_unix_nano,
                        None,
                    )
                });
                entry.0.push(transformed.span.span_id.clone());
                entry.1 = entry.1.min(transformed.span.start_time_unix_nano);
                entry.2 = entry.2.max(transformed.span.end_time_unix_nano);
                if entry.3.is_none() {
                    entry.3 = transformed.model.clone();
                }

                trace_conversations
                    .entry(transformed.span.trace_id.clone())
                    .or_insert_with(|| transformed.conversation_id.clone());

                batch.spans.push(transformed.span);
                batch.attributes.extend(transformed.attributes);
                batch.links.extend(transformed.links);
            }
        }
    }

    batch.conversation_deltas = deltas
        .into_iter()
        .map(|(conversation_id, (span_ids, first_start_time, last_end_time, model))| {
            ConversationDelta {
                conversation_id,
                span_ids,
                first_start_time,
                last_end_time,
                model,
            }
        })
        .collect();

    batch.trace_conversation_ids = trace_conversations.into_iter().collect();

    batch
}

fn resource_attrs(resource_spans: &ResourceSpans) -> Map<String, JsonValue> {
    resource_spans
        .resource
        .as_ref()
        .map(|r| key_values_to_map(&r.attributes))
        .unwrap_or_default()
}

/// Decodes an `ExportTraceServiceRequest` from a protobuf body. Spec §4.3:
/// unparseable input is the caller's 400 condition; empty body is valid
/// and decodes to an empty request.
pub fn decode_request(body: &[u8]) -> Result<ExportTraceServiceRequest, prost::DecodeError> {
    ExportTraceServiceRequest::decode(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
    use opentelemetry_proto::tonic::common::v1::{any_value::Value, AnyValue, KeyValue};
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span as OtlpSpan};

    fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(Value::StringValue(value.to_string())),
            }),
        }
    }

    fn otlp_span(name: &str, trace_id: &[u8], span_id: &[u8], attrs: Vec<KeyValue>) -> OtlpSpan {
        OtlpSpan {
            trace_id: trace_id.to_vec(),
            span_id: span_id.to_vec(),
            parent_span_id: vec![],
            name: name.to_string(),
            kind: 1,
            start_time_unix_nano: 100,
            end_time_unix_nano: 300,
            attributes: attrs,
            ..Default::default()
        }
    }

    // Scenario 1 (spec §8).
    #[test]
    fn test_build_batch_single_span_derives_conversation() {
        let span = otlp_span(
            "chat",
            &[1u8; 16],
            &[2u8; 8],
            vec![
                kv("gen_ai.conversation.id", "conv-A"),
                kv("gen_ai.request.model", "gpt-4"),
            ],
        );
        let request = ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: None,
                scope_spans: vec![ScopeSpans {
                    spans: vec![span],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };

        let batch = build_batch(&request);
        assert_eq!(batch.spans.len(), 1);
        assert_eq!(batch.conversation_deltas.len(), 1);
        assert_eq!(batch.conversation_deltas[0].conversation_id, "conv-A");
        assert_eq!(batch.conversation_deltas[0].first_start_time, 100);
        assert_eq!(batch.conversation_deltas[0].last_end_time, 300);
        assert_eq!(batch.conversation_deltas[0].model.as_deref(), Some("gpt-4"));
        assert_eq!(batch.spans[0].duration_ms(), 0);
    }

    // Scenario 4 (spec §8): empty attributes fall back to trace id.
    #[test]
    fn test_build_batch_falls_back_to_trace_id() {
        let trace_id = [3u8; 16];
        let span = otlp_span("op", &trace_id, &[4u8; 8], vec![]);
        let request = ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: None,
                scope_spans: vec![ScopeSpans {
                    spans: vec![span],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };

        let batch = build_batch(&request);
        assert_eq!(batch.conversation_deltas[0].conversation_id, hex::encode(trace_id));
    }

    #[test]
    fn test_build_batch_merges_resource_attributes() {
        let span = otlp_span("op", &[5u8; 16], &[6u8; 8], vec![]);
        let request = ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![kv("service.name", "checkout")],
                    ..Default::default()
                }),
                scope_spans: vec![ScopeSpans {
                    spans: vec![span],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };

        let batch = build_batch(&request);
        let attrs = &batch.attributes;
        assert!(attrs.iter().any(|a| a.key == "resource.service.name"));
        assert!(attrs.iter().any(|a| a.key == "service.name"));
    }

    // spec §4.3: event timestamps are RFC3339 nanos, not raw decimal integers.
    #[test]
    fn test_transform_span_renders_event_timestamp_as_rfc3339() {
        use opentelemetry_proto::tonic::trace::v1::span::Event;

        let mut span = otlp_span("op", &[7u8; 16], &[8u8; 8], vec![]);
        span.events = vec![Event {
            time_unix_nano: 1_700_000_000_123_456_789,
            name: "retry".to_string(),
            attributes: vec![],
            ..Default::default()
        }];

        let transformed = transform_span(&span, &Map::new());
        let events = transformed.span.events_json.as_array().unwrap();
        assert_eq!(events.len(), 1);
        let timestamp = events[0].get("timestamp").unwrap().as_str().unwrap();
        assert!(
            timestamp.contains('T') && (timestamp.ends_with('Z') || timestamp.contains('+')),
            "expected RFC3339 timestamp, got {timestamp}"
        );
        assert!(!timestamp.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_build_batch_empty_request_yields_empty_batch() {
        let request = ExportTraceServiceRequest { resource_spans: vec![] };
        let batch = build_batch(&request);
        assert!(batch.spans.is_empty());
        assert!(batch.conversation_deltas.is_empty());
    }

    #[test]
    fn test_any_value_to_json_preserves_types() {
        assert_eq!(
            any_value_to_json(&AnyValue {
                value: Some(Value::IntValue(42)),
            }),
            JsonValue::from(42)
        );
        assert_eq!(
            any_value_to_json(&AnyValue {
                value: Some(Value::BoolValue(true)),
            }),
            JsonValue::Bool(true)
        );
        assert_eq!(any_value_to_json(&AnyValue { value: None }), JsonValue::Null);
    }

    #[test]
    fn test_decode_request_rejects_garbage() {
        let result = decode_request(&[0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_request_accepts_empty_body() {
        let result = decode_request(&[]).unwrap();
        assert!(result.resource_spans.is_empty());
    }
}
