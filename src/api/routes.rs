//! HTTP handlers (spec §6 "External Interfaces").

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceResponse;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::core::constants::{
    CONVERSATIONS_DEFAULT_LIMIT, CONVERSATIONS_MAX_LIMIT, SPANS_DEFAULT_LIMIT, SPANS_MAX_LIMIT,
    TRACE_GROUP_DEFAULT_LIMIT, TRACE_GROUP_MAX_LIMIT,
};
use crate::domain::{nanos_to_rfc3339, Conversation, Span};
use crate::error::ApiError;
use crate::import::{self, ImportRequest};
use crate::ingest;
use crate::store::Store;

pub type AppState = Arc<dyn Store>;

fn clamp_limit(requested: Option<u32>, default: u32, max: u32) -> u32 {
    match requested {
        Some(0) | None => default,
        Some(n) if n > max => max,
        Some(n) => n,
    }
}

/// Pagination cursors are RFC3339(Nano) timestamps; invalid cursors
/// silently degrade to "no cursor" (spec §6).
fn parse_cursor(raw: Option<&str>) -> Option<i64> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_nanos_opt().unwrap_or(0))
}


#[derive(Debug, Serialize)]
pub struct ConversationDto {
    pub id: String,
    pub first_start_time: i64,
    pub last_end_time: i64,
    pub span_count: i64,
    pub model: Option<String>,
}

impl From<Conversation> for ConversationDto {
    fn from(c: Conversation) -> Self {
        Self {
            id: c.id,
            first_start_time: c.first_start_time,
            last_end_time: c.last_end_time,
            span_count: c.span_count,
            model: c.model,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SpanDto {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: i64,
    pub status_code: String,
    pub status_description: Option<String>,
    pub attributes: serde_json::Value,
    pub events: serde_json::Value,
}

impl From<Span> for SpanDto {
    fn from(s: Span) -> Self {
        Self {
            span_id: s.span_id.clone(),
            trace_id: s.trace_id.clone(),
            parent_span_id: s.parent_span_id.clone(),
            name: s.name.clone(),
            start_time: s.start_time_unix_nano,
            end_time: s.end_time_unix_nano,
            duration_ms: s.duration_ms(),
            status_code: s.status_code.as_str().to_string(),
            status_description: s.status_description.clone(),
            attributes: s.attributes_json.clone(),
            events: s.events_json.clone(),
        }
    }
}

// ---------------------------------------------------------------------
// OTLP ingest
// ---------------------------------------------------------------------

/// `POST /v1/traces` (spec §4.3, §6).
pub async fn export_traces(State(store): State<AppState>, body: Bytes) -> Response {
    let request = match ingest::decode_request(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode OTLP export request");
            return (StatusCode::BAD_REQUEST, "invalid OTLP request").into_response();
        }
    };

    let batch = ingest::build_batch(&request);
    if let Err(e) = store.ingest(batch).await {
        tracing::warn!(error = %e, "OTLP ingest batch failed");
        return (e.status_code(), "ingest failed").into_response();
    }

    let response = ExportTraceServiceResponse {
        partial_success: None,
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-protobuf")],
        response.encode_to_vec(),
    )
        .into_response()
}

// ---------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    pub limit: Option<u32>,
    pub before: Option<String>,
}

/// `GET /api/conversations` (spec §4.4, §6).
pub async fn list_conversations(
    State(store): State<AppState>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<ConversationDto>>, ApiError> {
    let limit = clamp_limit(query.limit, CONVERSATIONS_DEFAULT_LIMIT, CONVERSATIONS_MAX_LIMIT);
    let before = parse_cursor(query.before.as_deref());
    let conversations = store.list_conversations(limit, before).await?;
    Ok(Json(conversations.into_iter().map(ConversationDto::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
    pub deleted: u64,
}

/// `DELETE /api/conversations/{id}` (spec §4.4, §6).
pub async fn delete_conversation(
    State(store): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = store.delete_conversation(&id).await?;
    Ok(Json(DeleteResponse { ok: true, deleted }))
}

// ---------------------------------------------------------------------
// Trace groups
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListTraceGroupQuery {
    pub limit: Option<u32>,
    pub q: Option<String>,
}

/// `GET /api/trace-groups/{id}` (spec §4.4, §6).
pub async fn list_trace_group_spans(
    State(store): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListTraceGroupQuery>,
) -> Result<Json<Vec<SpanDto>>, ApiError> {
    let limit = clamp_limit(query.limit, TRACE_GROUP_DEFAULT_LIMIT, TRACE_GROUP_MAX_LIMIT);
    let spans = store
        .list_trace_group_spans(&id, limit, query.q.as_deref())
        .await?;
    Ok(Json(spans.into_iter().map(SpanDto::from).collect()))
}

// ---------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListSpansQuery {
    pub limit: Option<u32>,
    pub before: Option<String>,
}

/// `GET /api/spans` (spec §6).
pub async fn list_spans(
    State(store): State<AppState>,
    Query(query): Query<ListSpansQuery>,
) -> Result<Json<Vec<SpanDto>>, ApiError> {
    let limit = clamp_limit(query.limit, SPANS_DEFAULT_LIMIT, SPANS_MAX_LIMIT);
    let before = parse_cursor(query.before.as_deref());
    let spans = store.list_spans(limit, before).await?;
    Ok(Json(spans.into_iter().map(SpanDto::from).collect()))
}

/// `POST /api/spans/import` (spec §4.5, §6).
pub async fn import_spans(
    State(store): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let batch = import::process(request).await?;
    let span_count = batch.spans.len() as u64;
    store.ingest(batch).await?;
    Ok(Json(DeleteResponse {
        ok: true,
        deleted: span_count,
    }))
}

// ---------------------------------------------------------------------
// Legacy /api/traces stub (spec §6: "kept for back-compat; not part of
// the core"). Reshapes conversation-derived data under the old field
// names rather than implementing the original CRUD surface.
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct LegacyTraceDto {
    pub trace_id: String,
    pub timestamp: String,
    pub name: String,
}

pub async fn list_legacy_traces(
    State(store): State<AppState>,
) -> Result<Json<Vec<LegacyTraceDto>>, ApiError> {
    let spans = store.list_spans(SPANS_DEFAULT_LIMIT, None).await?;
    Ok(Json(
        spans
            .into_iter()
            .map(|s| LegacyTraceDto {
                trace_id: s.trace_id,
                timestamp: nanos_to_rfc3339(s.start_time_unix_nano),
                name: s.name,
            })
            .collect(),
    ))
}

// ---------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}
