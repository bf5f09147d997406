//! Attribute Normalizer (spec §4.1) and Conversation Key Derivation (spec §4.2).
//!
//! Operates on plain `serde_json::Value` trees so it is usable from both the
//! OTLP ingest pipeline (after OTLP `AnyValue`s are converted to JSON) and
//! the JSONL import pipeline (which reads JSON objects directly).

use serde_json::{Map, Value as JsonValue};

use crate::domain::AttrValue;

/// The conversation-id attribute keys, in priority order (spec §4.2). This
/// constant is the single source of truth: the SQL group-id expression in
/// `store::dialect` must emit a `CASE` over the same keys in the same
/// order, and a fixture test in `store` asserts the two agree.
pub const CONVERSATION_KEY_PRIORITY: &[&str] = &[
    "gcp.vertex.agent.session_id",
    "gen_ai.conversation.id",
    "conversation.id",
    "conversation_id",
    "session.conversation_id",
    "session.id",
    "chat.id",
    "thread.id",
];

/// Keys probed, in order, to find the model name (spec §4.1).
const MODEL_KEY_PRIORITY: &[&str] = &[
    "st.model",
    "llm.model",
    "gen_ai.request.model",
    "openai.model",
    "anthropic.model",
    "vertex.model",
    "google.vertex.model",
    "ai.model",
    "model",
];

const VENDOR_MODEL_TOKENS: &[&str] = &["gpt", "gemini", "claude"];

/// Recursively flattens map-valued nodes with dot-concatenated keys.
/// Arrays are never recursed into — they are kept whole (spec §4.1).
pub fn flatten(attrs: &Map<String, JsonValue>) -> Vec<(String, JsonValue)> {
    let mut out = Vec::new();
    flatten_into(attrs, "", &mut out);
    out
}

fn flatten_into(map: &Map<String, JsonValue>, prefix: &str, out: &mut Vec<(String, JsonValue)>) {
    for (k, v) in map {
        if k.is_empty() {
            continue;
        }
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            JsonValue::Object(inner) => flatten_into(inner, &key, out),
            other => out.push((key, other.clone())),
        }
    }
}

/// Classifies a flattened leaf value into the typed column it is stored
/// under (spec §4.1 "Type classification").
pub fn classify(value: &JsonValue) -> AttrValue {
    match value {
        JsonValue::Null => AttrValue::Null,
        JsonValue::Bool(b) => AttrValue::Bool(*b),
        JsonValue::String(s) => {
            // Numeric strings parseable as int64 classify as int (spec §4.1).
            if let Ok(i) = s.parse::<i64>() {
                AttrValue::Int(i)
            } else if let Ok(f) = s.parse::<f64>() {
                AttrValue::Float(f)
            } else {
                AttrValue::String(s.clone())
            }
        }
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                AttrValue::Int(i)
            } else if let Some(f) = n.as_f64() {
                AttrValue::Float(f)
            } else {
                // arbitrary_precision integers too large for i64/f64 fall
                // back to their textual form.
                AttrValue::String(n.to_string())
            }
        }
        JsonValue::Array(_) => AttrValue::Json(value.clone()),
        JsonValue::Object(_) => AttrValue::Json(value.clone()),
    }
}

/// Applies vendor-specific JSON augmentation (spec §4.1) to the top-level
/// attribute map, *before* flattening, so derived keys participate in
/// search. Malformed vendor JSON is silently ignored — the raw key is left
/// untouched and no derived keys are added.
pub fn augment_vendor_json(attrs: &mut Map<String, JsonValue>) {
    augment_vertex_request(attrs);
    augment_vertex_response(attrs);
}

fn vendor_json_str<'a>(attrs: &'a Map<String, JsonValue>, key: &str) -> Option<&'a str> {
    attrs.get(key).and_then(|v| v.as_str())
}

fn augment_vertex_request(attrs: &mut Map<String, JsonValue>) {
    let Some(raw) = vendor_json_str(attrs, "gcp.vertex.agent.llm_request") else {
        return;
    };
    let Ok(parsed) = serde_json::from_str::<JsonValue>(raw) else {
        return;
    };

    if let Some(instruction) = parsed.pointer("/config/system_instruction") {
        attrs
            .entry("st.system_instruction".to_string())
            .or_insert_with(|| instruction.clone());
    }

    if let Some(contents) = parsed.get("contents").and_then(|v| v.as_array()) {
        let last_user_texts: Option<Vec<String>> = contents
            .iter()
            .rev()
            .find(|c| c.get("role").and_then(|r| r.as_str()) == Some("user"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .map(str::to_string)
                    .collect()
            });

        if let Some(texts) = last_user_texts {
            if !texts.is_empty() && !attrs.contains_key("gen_ai.prompt") {
                attrs.insert(
                    "gen_ai.prompt".to_string(),
                    JsonValue::String(texts.join("\n\n")),
                );
            }
        }

        attrs
            .entry("st.messages".to_string())
            .or_insert_with(|| JsonValue::Array(contents.clone()));
    }
}

fn augment_vertex_response(attrs: &mut Map<String, JsonValue>) {
    let Some(raw) = vendor_json_str(attrs, "gcp.vertex.agent.llm_response") else {
        return;
    };
    let Ok(parsed) = serde_json::from_str::<JsonValue>(raw) else {
        return;
    };

    if let Some(texts) = parsed.pointer("/content/parts").and_then(|v| v.as_array()) {
        let joined: String = texts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("");
        if !joined.is_empty() && !attrs.contains_key("gen_ai.response") {
            attrs.insert("gen_ai.response".to_string(), JsonValue::String(joined));
        }
    }

    if let Some(prompt_tokens) = parsed.pointer("/usage_metadata/prompt_token_count") {
        attrs
            .entry("gen_ai.usage.input_tokens".to_string())
            .or_insert_with(|| prompt_tokens.clone());
    }
    if let Some(candidates_tokens) = parsed.pointer("/usage_metadata/candidates_token_count") {
        attrs
            .entry("gen_ai.usage.output_tokens".to_string())
            .or_insert_with(|| candidates_tokens.clone());
    }
}

/// Known vendor request/response JSON-string keys probed for an embedded
/// `model` field (spec §4.1 step 2).
const VENDOR_JSON_KEYS: &[&str] = &[
    "gcp.vertex.agent.llm_request",
    "gcp.vertex.agent.llm_response",
];

/// Probes the known vendor request/response JSON strings for an embedded
/// top-level `model` field (spec §4.1: "then embedded `model` fields inside
/// known request/response JSONs"). Malformed vendor JSON is ignored, same
/// as `augment_vendor_json`.
fn embedded_model(attrs: &Map<String, JsonValue>) -> Option<String> {
    for key in VENDOR_JSON_KEYS {
        let Some(raw) = vendor_json_str(attrs, key) else {
            continue;
        };
        let Ok(parsed) = serde_json::from_str::<JsonValue>(raw) else {
            continue;
        };
        if let Some(model) = parsed.get("model").and_then(|v| v.as_str()) {
            if !model.is_empty() {
                return Some(model.to_string());
            }
        }
    }
    None
}

/// Derives `st.model` by probing, in order: the keys in
/// `MODEL_KEY_PRIORITY`; then a `model` field embedded inside the known
/// vendor request/response JSONs; then a vendor token inside
/// `resource.service.name` (spec §4.1). Returns `None` when nothing
/// matches ("the model is left unset").
pub fn derive_model(attrs: &Map<String, JsonValue>) -> Option<String> {
    for key in MODEL_KEY_PRIORITY {
        if let Some(v) = attrs.get(*key).and_then(|v| v.as_str()) {
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }

    if let Some(model) = embedded_model(attrs) {
        return Some(model);
    }

    if let Some(service_name) = attrs
        .get("resource.service.name")
        .and_then(|v| v.as_str())
    {
        let lower = service_name.to_ascii_lowercase();
        if VENDOR_MODEL_TOKENS.iter().any(|tok| lower.contains(tok)) {
            return Some(service_name.to_string());
        }
    }

    None
}

/// Heuristic span category assignment (spec §4.1).
pub fn categorize_span(name: &str, attrs: &Map<String, JsonValue>) -> &'static str {
    let lower_name = name.to_ascii_lowercase();
    let has_key_prefix = |prefix: &str| attrs.keys().any(|k| k.starts_with(prefix));

    if has_key_prefix("gen_ai.") || has_key_prefix("llm.") || lower_name.contains("llm") {
        "llm"
    } else if has_key_prefix("http.") || lower_name.contains("http") {
        "http"
    } else if has_key_prefix("db.") || lower_name.contains("db") || lower_name.contains("sql") {
        "db"
    } else if lower_name.contains("agent") {
        "agent"
    } else if lower_name.contains("tool") {
        "tool"
    } else {
        "other"
    }
}

/// Scans flattened attributes for a conversation key in priority order,
/// falling back to the OTLP trace id (spec §4.2).
pub fn derive_conversation_key(attrs: &[(String, AttrValue)], trace_id: &str) -> String {
    for key in CONVERSATION_KEY_PRIORITY {
        if let Some(value) = attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v) {
            if let Some(text) = value.as_text() {
                return text;
            }
        }
    }
    trace_id.to_string()
}
