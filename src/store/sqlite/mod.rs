//! SQLite storage backend (embedded deployments).
//!
//! Optimized for single-process, low-latency local use via WAL mode,
//! matching the teacher's `SqliteService` connection setup. No background
//! checkpoint task is spawned — spec §5 rules out internal task queues or
//! background workers for this service.

pub mod schema;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::domain::{AttrValue, Conversation, Span, SpanAttribute, SpanLink, StatusCode};
use crate::error::StoreError;
use crate::store::dialect::group_id_expr;
use crate::store::sqlite_dialect::SqliteDialect;
use crate::store::{ConversationDelta, IngestBatch, Store};

const SEARCH_COLUMNS: &[&str] = &[
    "name",
    "span_id",
    "trace_id",
    "status_code",
    "status_description",
    "attributes_json",
    "events_json",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to (creating if missing) the SQLite file at `path`.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await.map_err(StoreError::sqlite)?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn status_code_to_text(code: &StatusCode) -> &'static str {
        code.as_str()
    }

    fn status_code_from_text(s: &str) -> StatusCode {
        match s {
            "OK" => StatusCode::Ok,
            "ERROR" => StatusCode::Error,
            _ => StatusCode::Unset,
        }
    }

    fn row_to_span(row: &sqlx::sqlite::SqliteRow) -> Result<Span, StoreError> {
        let attributes_raw: String = row.try_get("attributes_json").map_err(StoreError::sqlite)?;
        let events_raw: String = row.try_get("events_json").map_err(StoreError::sqlite)?;
        Ok(Span {
            span_id: row.try_get("span_id").map_err(StoreError::sqlite)?,
            trace_id: row.try_get("trace_id").map_err(StoreError::sqlite)?,
            parent_span_id: row.try_get("parent_span_id").map_err(StoreError::sqlite)?,
            name: row.try_get("name").map_err(StoreError::sqlite)?,
            start_time_unix_nano: row.try_get("start_time").map_err(StoreError::sqlite)?,
            end_time_unix_nano: row.try_get("end_time").map_err(StoreError::sqlite)?,
            status_code: Self::status_code_from_text(&row.try_get::<String, _>("status_code").map_err(StoreError::sqlite)?),
            status_description: row.try_get("status_description").map_err(StoreError::sqlite)?,
            attributes_json: serde_json::from_str(&attributes_raw)
                .unwrap_or(serde_json::Value::Null),
            events_json: serde_json::from_str(&events_raw).unwrap_or(serde_json::Value::Null),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(schema::SCHEMA).execute(&self.pool).await.map_err(StoreError::sqlite)?;
        Ok(())
    }

    async fn ingest(&self, batch: IngestBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::sqlite)?;

        for span in &batch.spans {
            sqlx::query(
                "INSERT INTO spans (span_id, trace_id, parent_span_id, name, start_time, \
                 end_time, duration_ms, status_code, status_description, attributes_json, \
                 events_json) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(span_id) DO UPDATE SET \
                   trace_id = excluded.trace_id, \
                   parent_span_id = excluded.parent_span_id, \
                   name = excluded.name, \
                   start_time = excluded.start_time, \
                   end_time = excluded.end_time, \
                   duration_ms = excluded.duration_ms, \
                   status_code = excluded.status_code, \
                   status_description = excluded.status_description, \
                   attributes_json = excluded.attributes_json, \
                   events_json = excluded.events_json",
            )
            .bind(&span.span_id)
            .bind(&span.trace_id)
            .bind(&span.parent_span_id)
            .bind(&span.name)
            .bind(span.start_time_unix_nano)
            .bind(span.end_time_unix_nano)
            .bind(span.duration_ms())
            .bind(Self::status_code_to_text(&span.status_code))
            .bind(&span.status_description)
            .bind(span.attributes_json.to_string())
            .bind(span.events_json.to_string())
            .execute(&mut *tx)
            .await.map_err(StoreError::sqlite)?;
        }

        for attr in &batch.attributes {
            let (string_val, int_val, float_val, bool_val, json_val): (
                Option<String>,
                Option<i64>,
                Option<f64>,
                Option<bool>,
                Option<String>,
            ) = match &attr.value {
                AttrValue::String(s) => (Some(s.clone()), None, None, None, None),
                AttrValue::Int(i) => (None, Some(*i), None, None, None),
                AttrValue::Float(f) => (None, None, Some(*f), None, None),
                AttrValue::Bool(b) => (None, None, None, Some(*b), None),
                AttrValue::Json(v) => (None, None, None, None, Some(v.to_string())),
                AttrValue::Null => (None, None, None, None, None),
            };

            sqlx::query(
                "INSERT INTO span_attributes (span_id, trace_id, key, type, string_val, \
                 int_val, float_val, bool_val, json_val) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(span_id, key) DO UPDATE SET \
                   trace_id = excluded.trace_id, \
                   type = excluded.type, \
                   string_val = excluded.string_val, \
                   int_val = excluded.int_val, \
                   float_val = excluded.float_val, \
                   bool_val = excluded.bool_val, \
                   json_val = excluded.json_val",
            )
            .bind(&attr.span_id)
            .bind(&attr.trace_id)
            .bind(&attr.key)
            .bind(attr.value.type_tag())
            .bind(string_val)
            .bind(int_val)
            .bind(float_val)
            .bind(bool_val)
            .bind(json_val)
            .execute(&mut *tx)
            .await.map_err(StoreError::sqlite)?;
        }

        for link in &batch.links {
            sqlx::query("DELETE FROM span_links WHERE span_id = ?")
                .bind(&link.span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::sqlite)?;
            sqlx::query(
                "INSERT INTO span_links (span_id, trace_id, linked_trace_id, linked_span_id) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&link.span_id)
            .bind(&link.trace_id)
            .bind(&link.linked_trace_id)
            .bind(&link.linked_span_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::sqlite)?;
        }

        for delta in &batch.conversation_deltas {
            let mut new_members = 0u64;
            for span_id in &delta.span_ids {
                let result = sqlx::query(
                    "INSERT OR IGNORE INTO conversation_members (conversation_id, span_id) \
                     VALUES (?, ?)",
                )
                .bind(&delta.conversation_id)
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::sqlite)?;
                new_members += result.rows_affected();
            }

            sqlx::query(
                "INSERT INTO conversations (id, first_start_time, last_end_time, span_count, \
                 model) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                   first_start_time = min(conversations.first_start_time, excluded.first_start_time), \
                   last_end_time = max(conversations.last_end_time, excluded.last_end_time), \
                   span_count = conversations.span_count + ?, \
                   model = COALESCE(conversations.model, excluded.model)",
            )
            .bind(&delta.conversation_id)
            .bind(delta.first_start_time)
            .bind(delta.last_end_time)
            .bind(new_members as i64)
            .bind(&delta.model)
            .bind(new_members as i64)
            .execute(&mut *tx)
            .await.map_err(StoreError::sqlite)?;
        }

        // Conversation-id propagation to siblings (spec §4.2, DESIGN.md Open
        // Question 2): one statement per trace id, not a per-row loop.
        for (trace_id, conversation_id) in &batch.trace_conversation_ids {
            let mut case_when = String::new();
            for key in crate::normalize::CONVERSATION_KEY_PRIORITY {
                case_when.push_str(&format!("key = '{key}' OR "));
            }
            case_when.push_str("1 = 0");

            sqlx::query(&format!(
                "INSERT INTO span_attributes (span_id, trace_id, key, type, string_val) \
                 SELECT s.span_id, s.trace_id, 'conversation_id', 'string', ? \
                 FROM spans s \
                 WHERE s.trace_id = ? \
                 AND NOT EXISTS ( \
                   SELECT 1 FROM span_attributes sa \
                   WHERE sa.span_id = s.span_id AND ({case_when}) \
                 ) \
                 ON CONFLICT(span_id, key) DO UPDATE SET string_val = excluded.string_val"
            ))
            .bind(conversation_id)
            .bind(trace_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::sqlite)?;
        }

        tx.commit().await.map_err(StoreError::sqlite)?;
        Ok(())
    }

    async fn list_conversations(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let sql = if before.is_some() {
            "SELECT id, first_start_time, last_end_time, span_count, model FROM conversations \
             WHERE last_end_time < ? ORDER BY last_end_time DESC LIMIT ?"
        } else {
            "SELECT id, first_start_time, last_end_time, span_count, model FROM conversations \
             ORDER BY last_end_time DESC LIMIT ?"
        };

        let mut query = sqlx::query(sql);
        if let Some(before) = before {
            query = query.bind(before);
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(StoreError::sqlite)?;
        Ok(rows
            .iter()
            .map(|row| Conversation {
                id: row.get("id"),
                first_start_time: row.get("first_start_time"),
                last_end_time: row.get("last_end_time"),
                span_count: row.get("span_count"),
                model: row.get("model"),
            })
            .collect())
    }

    async fn list_trace_group_spans(
        &self,
        conversation_id: &str,
        limit: u32,
        q: Option<&str>,
    ) -> Result<Vec<Span>, StoreError> {
        let expr = group_id_expr(&SqliteDialect, "spans");
        let search_clause = q
            .map(|_| {
                let ors: Vec<String> = SEARCH_COLUMNS
                    .iter()
                    .map(|c| format!("spans.{c} LIKE ?"))
                    .collect();
                format!(" AND ({})", ors.join(" OR "))
            })
            .unwrap_or_default();

        let sql = format!(
            "SELECT spans.span_id, spans.trace_id, spans.parent_span_id, spans.name, \
             spans.start_time, spans.end_time, spans.status_code, spans.status_description, \
             spans.attributes_json, spans.events_json FROM spans \
             WHERE ({expr}) = ?{search_clause} \
             ORDER BY spans.start_time ASC, spans.span_id ASC LIMIT ?"
        );

        let mut query = sqlx::query(&sql).bind(conversation_id);
        if let Some(q) = q {
            let pattern = format!("%{q}%");
            for _ in SEARCH_COLUMNS {
                query = query.bind(pattern.clone());
            }
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(StoreError::sqlite)?;
        rows.iter().map(Self::row_to_span).collect()
    }

    async fn list_spans(&self, limit: u32, before: Option<i64>) -> Result<Vec<Span>, StoreError> {
        let sql = if before.is_some() {
            "SELECT span_id, trace_id, parent_span_id, name, start_time, end_time, status_code, \
             status_description, attributes_json, events_json FROM spans \
             WHERE start_time < ? ORDER BY start_time DESC, span_id DESC LIMIT ?"
        } else {
            "SELECT span_id, trace_id, parent_span_id, name, start_time, end_time, status_code, \
             status_description, attributes_json, events_json FROM spans \
             ORDER BY start_time DESC, span_id DESC LIMIT ?"
        };

        let mut query = sqlx::query(sql);
        if let Some(before) = before {
            query = query.bind(before);
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(StoreError::sqlite)?;
        rows.iter().map(Self::row_to_span).collect()
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::sqlite)?;

        let expr = group_id_expr(&SqliteDialect, "spans");
        let span_ids: Vec<String> = sqlx::query(&format!(
            "SELECT span_id FROM spans WHERE ({expr}) = ?"
        ))
        .bind(conversation_id)
        .fetch_all(&mut *tx)
        .await.map_err(StoreError::sqlite)?
        .iter()
        .map(|r| r.get::<String, _>("span_id"))
        .collect();

        let mut deleted = 0u64;
        for span_id in &span_ids {
            sqlx::query("DELETE FROM span_attributes WHERE span_id = ?")
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::sqlite)?;
            sqlx::query("DELETE FROM span_links WHERE span_id = ?")
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::sqlite)?;
            sqlx::query("DELETE FROM conversation_members WHERE span_id = ?")
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::sqlite)?;
            let result = sqlx::query("DELETE FROM spans WHERE span_id = ?")
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::sqlite)?;
            deleted += result.rows_affected();
        }

        let remaining: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM conversation_members WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await.map_err(StoreError::sqlite)?
        .get("n");

        if remaining == 0 {
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::sqlite)?;
        } else {
            sqlx::query("UPDATE conversations SET span_count = ? WHERE id = ?")
                .bind(remaining)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::sqlite)?;
        }

        tx.commit().await.map_err(StoreError::sqlite)?;
        Ok(deleted)
    }

    async fn delete_trace(&self, trace_id: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::sqlite)?;

        sqlx::query("DELETE FROM span_attributes WHERE trace_id = ?")
            .bind(trace_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::sqlite)?;
        sqlx::query("DELETE FROM span_links WHERE trace_id = ?")
            .bind(trace_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::sqlite)?;
        let result = sqlx::query("DELETE FROM spans WHERE trace_id = ?")
            .bind(trace_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::sqlite)?;

        tx.commit().await.map_err(StoreError::sqlite)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttrValue;

    async fn test_store() -> SqliteStore {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let store = SqliteStore::from_pool(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn span(span_id: &str, trace_id: &str, start: i64, end: i64) -> Span {
        Span {
            span_id: span_id.to_string(),
            trace_id: trace_id.to_string(),
            parent_span_id: None,
            name: "op".to_string(),
            start_time_unix_nano: start,
            end_time_unix_nano: end,
            status_code: StatusCode::Unset,
            status_description: None,
            attributes_json: serde_json::json!({}),
            events_json: serde_json::json!([]),
        }
    }

    // Scenario 1 (spec §8): a single span with a conversation-id attribute.
    #[tokio::test]
    async fn test_ingest_single_span_creates_conversation() {
        let store = test_store().await;
        let batch = IngestBatch {
            spans: vec![span("S1", "T1", 100, 300)],
            attributes: vec![SpanAttribute {
                span_id: "S1".into(),
                trace_id: "T1".into(),
                key: "gen_ai.conversation.id".into(),
                value: AttrValue::String("conv-A".into()),
            }],
            links: vec![],
            conversation_deltas: vec![ConversationDelta {
                conversation_id: "conv-A".into(),
                span_ids: vec!["S1".into()],
                first_start_time: 100,
                last_end_time: 300,
                model: Some("gpt-4".into()),
            }],
            trace_conversation_ids: vec![("T1".into(), "conv-A".into())],
        };
        store.ingest(batch).await.unwrap();

        let convs = store.list_conversations(10, None).await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].id, "conv-A");
        assert_eq!(convs[0].first_start_time, 100);
        assert_eq!(convs[0].last_end_time, 300);
        assert_eq!(convs[0].span_count, 1);
        assert_eq!(convs[0].model.as_deref(), Some("gpt-4"));

        let spans = store.list_trace_group_spans("conv-A", 10, None).await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].duration_ms(), 0);
    }

    // Scenario 2 (spec §8): a second span widens the aggregate and bumps count.
    #[tokio::test]
    async fn test_ingest_second_span_widens_aggregate() {
        let store = test_store().await;
        let first = IngestBatch {
            spans: vec![span("S1", "T1", 100, 300)],
            attributes: vec![SpanAttribute {
                span_id: "S1".into(),
                trace_id: "T1".into(),
                key: "gen_ai.conversation.id".into(),
                value: AttrValue::String("conv-A".into()),
            }],
            links: vec![],
            conversation_deltas: vec![ConversationDelta {
                conversation_id: "conv-A".into(),
                span_ids: vec!["S1".into()],
                first_start_time: 100,
                last_end_time: 300,
                model: None,
            }],
            trace_conversation_ids: vec![],
        };
        store.ingest(first).await.unwrap();

        let second = IngestBatch {
            spans: vec![span("S2", "T2", 5_000_000_000, 6_000_000_000)],
            attributes: vec![SpanAttribute {
                span_id: "S2".into(),
                trace_id: "T2".into(),
                key: "gen_ai.conversation.id".into(),
                value: AttrValue::String("conv-A".into()),
            }],
            links: vec![],
            conversation_deltas: vec![ConversationDelta {
                conversation_id: "conv-A".into(),
                span_ids: vec!["S2".into()],
                first_start_time: 5_000_000_000,
                last_end_time: 6_000_000_000,
                model: None,
            }],
            trace_conversation_ids: vec![],
        };
        store.ingest(second).await.unwrap();

        let convs = store.list_conversations(10, None).await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].span_count, 2);
        assert_eq!(convs[0].first_start_time, 100);
        assert_eq!(convs[0].last_end_time, 6_000_000_000);
    }

    // Re-ingesting the same span+membership does not inflate span_count
    // (DESIGN.md Open Question 1: deduplicating policy).
    #[tokio::test]
    async fn test_reingest_same_span_does_not_double_count() {
        let store = test_store().await;
        let batch = || IngestBatch {
            spans: vec![span("S1", "T1", 100, 300)],
            attributes: vec![],
            links: vec![],
            conversation_deltas: vec![ConversationDelta {
                conversation_id: "conv-A".into(),
                span_ids: vec!["S1".into()],
                first_start_time: 100,
                last_end_time: 300,
                model: None,
            }],
            trace_conversation_ids: vec![],
        };
        store.ingest(batch()).await.unwrap();
        store.ingest(batch()).await.unwrap();

        let convs = store.list_conversations(10, None).await.unwrap();
        assert_eq!(convs[0].span_count, 1);
    }

    // Scenario 4 (spec §8): empty attributes fall back to trace id.
    #[tokio::test]
    async fn test_list_trace_group_by_trace_id_fallback() {
        let store = test_store().await;
        let batch = IngestBatch {
            spans: vec![span("S1", "T3", 0, 0)],
            attributes: vec![],
            links: vec![],
            conversation_deltas: vec![ConversationDelta {
                conversation_id: "T3".into(),
                span_ids: vec!["S1".into()],
                first_start_time: 0,
                last_end_time: 0,
                model: None,
            }],
            trace_conversation_ids: vec![],
        };
        store.ingest(batch).await.unwrap();
        let spans = store.list_trace_group_spans("T3", 10, None).await.unwrap();
        assert_eq!(spans.len(), 1);
    }

    // Scenario 5 (spec §8): pagination cursor excludes boundary and overlaps none.
    #[tokio::test]
    async fn test_list_conversations_pagination() {
        let store = test_store().await;
        for i in 0..5i64 {
            let batch = IngestBatch {
                spans: vec![span(&format!("S{i}"), &format!("T{i}"), i, i)],
                attributes: vec![],
                links: vec![],
                conversation_deltas: vec![ConversationDelta {
                    conversation_id: format!("conv-{i}"),
                    span_ids: vec![format!("S{i}")],
                    first_start_time: i,
                    last_end_time: i,
                    model: None,
                }],
                trace_conversation_ids: vec![],
            };
            store.ingest(batch).await.unwrap();
        }

        let page1 = store.list_conversations(2, None).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].id, "conv-4");
        assert_eq!(page1[1].id, "conv-3");

        let page2 = store
            .list_conversations(2, Some(page1[1].last_end_time))
            .await
            .unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].id, "conv-2");
        assert_eq!(page2[1].id, "conv-1");
    }

    // Scenario 6 (spec §8): deletion completeness.
    #[tokio::test]
    async fn test_delete_conversation_removes_spans_and_attributes() {
        let store = test_store().await;
        let batch = IngestBatch {
            spans: vec![span("S1", "T1", 100, 300), span("S2", "T2", 500, 900)],
            attributes: vec![
                SpanAttribute {
                    span_id: "S1".into(),
                    trace_id: "T1".into(),
                    key: "gen_ai.conversation.id".into(),
                    value: AttrValue::String("conv-A".into()),
                },
                SpanAttribute {
                    span_id: "S2".into(),
                    trace_id: "T2".into(),
                    key: "gen_ai.conversation.id".into(),
                    value: AttrValue::String("conv-A".into()),
                },
            ],
            links: vec![],
            conversation_deltas: vec![ConversationDelta {
                conversation_id: "conv-A".into(),
                span_ids: vec!["S1".into(), "S2".into()],
                first_start_time: 100,
                last_end_time: 900,
                model: None,
            }],
            trace_conversation_ids: vec![],
        };
        store.ingest(batch).await.unwrap();

        let deleted = store.delete_conversation("conv-A").await.unwrap();
        assert_eq!(deleted, 2);

        let spans = store.list_trace_group_spans("conv-A", 10, None).await.unwrap();
        assert!(spans.is_empty());

        let remaining_attrs: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM span_attributes WHERE span_id IN ('S1', 'S2')")
                .fetch_one(&store.pool)
                .await
                .unwrap()
                .get("n");
        assert_eq!(remaining_attrs, 0);

        // conversation aggregate is cleaned up once count reaches zero
        let convs = store.list_conversations(10, None).await.unwrap();
        assert!(convs.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_propagation_to_siblings() {
        let store = test_store().await;
        let batch = IngestBatch {
            spans: vec![span("S1", "T1", 0, 0), span("S2", "T1", 1, 1)],
            attributes: vec![SpanAttribute {
                span_id: "S1".into(),
                trace_id: "T1".into(),
                key: "gen_ai.conversation.id".into(),
                value: AttrValue::String("conv-A".into()),
            }],
            links: vec![],
            conversation_deltas: vec![ConversationDelta {
                conversation_id: "conv-A".into(),
                span_ids: vec!["S1".into()],
                first_start_time: 0,
                last_end_time: 0,
                model: None,
            }],
            trace_conversation_ids: vec![("T1".into(), "conv-A".into())],
        };
        store.ingest(batch).await.unwrap();

        let spans = store.list_trace_group_spans("conv-A", 10, None).await.unwrap();
        let ids: Vec<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();
        assert!(ids.contains(&"S1"));
        assert!(ids.contains(&"S2"));
    }

    #[tokio::test]
    async fn test_ingest_persists_span_links_and_deletion_removes_them() {
        let store = test_store().await;
        let batch = IngestBatch {
            spans: vec![span("S1", "T1", 0, 0)],
            attributes: vec![],
            links: vec![SpanLink {
                span_id: "S1".into(),
                trace_id: "T1".into(),
                linked_trace_id: "T0".into(),
                linked_span_id: Some("S0".into()),
            }],
            conversation_deltas: vec![ConversationDelta {
                conversation_id: "T1".into(),
                span_ids: vec!["S1".into()],
                first_start_time: 0,
                last_end_time: 0,
                model: None,
            }],
            trace_conversation_ids: vec![],
        };
        store.ingest(batch).await.unwrap();

        let linked: (String, Option<String>) =
            sqlx::query_as("SELECT linked_trace_id, linked_span_id FROM span_links WHERE span_id = 'S1'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(linked.0, "T0");
        assert_eq!(linked.1.as_deref(), Some("S0"));

        store.delete_trace("T1").await.unwrap();
        let remaining: i64 = sqlx::query("SELECT COUNT(*) AS n FROM span_links WHERE span_id = 'S1'")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(remaining, 0);
    }

    // Grouping coherence (spec.md:163, Design Notes spec.md:179): the SQL
    // group-id expression and `normalize::derive_conversation_key` must
    // agree on the same fixture, key-major (a higher-priority key stored
    // as int_val still outranks a lower-priority key stored as string_val).
    #[tokio::test]
    async fn test_group_id_expr_agrees_with_derive_conversation_key_mixed_types() {
        let store = test_store().await;
        store
            .ingest(IngestBatch {
                spans: vec![span("S1", "T1", 0, 0)],
                attributes: vec![
                    SpanAttribute {
                        span_id: "S1".into(),
                        trace_id: "T1".into(),
                        key: "gcp.vertex.agent.session_id".into(),
                        value: AttrValue::Int(42),
                    },
                    SpanAttribute {
                        span_id: "S1".into(),
                        trace_id: "T1".into(),
                        key: "gen_ai.conversation.id".into(),
                        value: AttrValue::String("conv-B".into()),
                    },
                ],
                links: vec![],
                conversation_deltas: vec![],
                trace_conversation_ids: vec![],
            })
            .await
            .unwrap();

        let expr = group_id_expr(&SqliteDialect, "spans");
        let sql_result: String = sqlx::query(&format!("SELECT ({expr}) AS gid FROM spans WHERE span_id = 'S1'"))
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("gid");

        let rust_attrs = vec![
            (
                "gcp.vertex.agent.session_id".to_string(),
                AttrValue::Int(42),
            ),
            (
                "gen_ai.conversation.id".to_string(),
                AttrValue::String("conv-B".into()),
            ),
        ];
        let rust_result = crate::normalize::derive_conversation_key(&rust_attrs, "T1");

        assert_eq!(sql_result, rust_result);
        assert_eq!(sql_result, "42");
    }
}
