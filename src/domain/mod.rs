//! Core data model: Span, SpanAttribute, Conversation, SpanLink.
//!
//! See spec.md §3 for the invariants these types carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Renders a nanosecond epoch timestamp as RFC3339 with nanosecond
/// precision (spec §4.3: event timestamps, and the pagination cursor
/// format in spec §6). Shared by the OTLP ingest pipeline and the REST
/// API so both render timestamps identically.
pub fn nanos_to_rfc3339(nanos: i64) -> String {
    DateTime::<Utc>::from_timestamp(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// A flattened, typed attribute value. Exactly one variant is populated
/// per stored row (spec §3: "exactly one populated value column per type").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttrValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Json(JsonValue),
    Null,
}

impl AttrValue {
    /// The type tag stored in `span_attributes.type`.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Json(v) if v.is_array() => "array",
            Self::Json(_) => "object",
            Self::Null => "null",
        }
    }

    /// Coerce to a decimal text form, used by conversation-key derivation
    /// (spec §4.2: "ints/floats are coerced to their decimal text form").
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::String(s) if !s.is_empty() => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            _ => None,
        }
    }
}

/// One flattened, typed attribute belonging to a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanAttribute {
    pub span_id: String,
    pub trace_id: String,
    pub key: String,
    pub value: AttrValue,
}

/// A span-to-span link carried by an OTLP span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanLink {
    pub span_id: String,
    pub trace_id: String,
    pub linked_trace_id: String,
    pub linked_span_id: Option<String>,
}

/// Status of a span, per OTLP's status proto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single persisted span (spec §3).
#[derive(Debug, Clone)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time_unix_nano: i64,
    pub end_time_unix_nano: i64,
    pub status_code: StatusCode,
    pub status_description: Option<String>,
    /// Serialized attributes-only JSON, for display (spec §3).
    pub attributes_json: JsonValue,
    /// Serialized events JSON (spec §4.3: `span.events`).
    pub events_json: JsonValue,
}

impl Span {
    /// `duration_ms = round((end - start) / 1ms)`, spec §3 invariant 2.
    /// `end_time` is clamped to `start_time` if the OTLP payload reports
    /// an end before the start, since the invariant requires `end >= start`.
    pub fn duration_ms(&self) -> i64 {
        let end = self.end_time_unix_nano.max(self.start_time_unix_nano);
        (end - self.start_time_unix_nano + 500_000) / 1_000_000
    }

    /// True when `parent_span_id` denotes a root span (spec §3 invariant 6).
    pub fn is_root(&self) -> bool {
        match &self.parent_span_id {
            None => true,
            Some(id) => id.is_empty() || id.bytes().all(|b| b == b'0'),
        }
    }
}

/// A conversation aggregate (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub first_start_time: i64,
    pub last_end_time: i64,
    pub span_count: i64,
    pub model: Option<String>,
}
