//! Storage Engine (spec §4.4): an abstract store with two concrete
//! backends, each owning its own SQL dialect including the grouping
//! expression. Callers above this boundary never see backend specifics.

pub mod dialect;
pub mod postgres;
pub mod postgres_dialect;
pub mod sqlite;
pub mod sqlite_dialect;

pub use dialect::{SqlDialect, group_id_expr};

use async_trait::async_trait;

use crate::domain::{Conversation, Span, SpanAttribute, SpanLink};
use crate::error::StoreError;

/// One batch's worth of conversation-aggregate input: the spans newly
/// assigned to `conversation_id` in this batch, pre-merged per id (spec
/// §4.3: "min/max/count/model merged per key within the batch before
/// store").
#[derive(Debug, Clone)]
pub struct ConversationDelta {
    pub conversation_id: String,
    pub span_ids: Vec<String>,
    pub first_start_time: i64,
    pub last_end_time: i64,
    pub model: Option<String>,
}

/// Everything derived from one OTLP export request or one JSONL import
/// call (spec §4.3 "Batching"): one batch each of spans, attributes, and
/// links, plus the conversation deltas to upsert.
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub spans: Vec<Span>,
    pub attributes: Vec<SpanAttribute>,
    pub links: Vec<SpanLink>,
    pub conversation_deltas: Vec<ConversationDelta>,
    /// Distinct OTLP trace ids that got a conversation id in this batch,
    /// used to propagate it to already-persisted siblings (spec §4.2).
    pub trace_conversation_ids: Vec<(String, String)>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Creates the schema if it does not already exist. Idempotent (spec §5).
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Persists one ingest batch transactionally (spec §4.3/§4.4): a write
    /// failure rolls back the entire batch.
    async fn ingest(&self, batch: IngestBatch) -> Result<(), StoreError>;

    /// `GET /api/conversations` (spec §4.4, §6): ordered `last_end_time DESC`.
    async fn list_conversations(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// `GET /api/trace-groups/{id}` (spec §4.4, §6): ordered
    /// `start_time ASC, span_id ASC`, optionally filtered by `q`.
    async fn list_trace_group_spans(
        &self,
        conversation_id: &str,
        limit: u32,
        q: Option<&str>,
    ) -> Result<Vec<Span>, StoreError>;

    /// `GET /api/spans` (spec §6): ordered `start_time DESC, span_id DESC`.
    async fn list_spans(&self, limit: u32, before: Option<i64>) -> Result<Vec<Span>, StoreError>;

    /// `DELETE /api/conversations/{id}` (spec §4.4): deletes every span
    /// whose group-id expression equals `conversation_id`, their attribute
    /// rows, and reconciles the conversation aggregate (DESIGN.md Open
    /// Question 3). Returns the number of spans deleted.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<u64, StoreError>;

    /// Deletes all spans/attributes for an OTLP trace id (spec §4.4).
    async fn delete_trace(&self, trace_id: &str) -> Result<u64, StoreError>;
}
