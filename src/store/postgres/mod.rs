//! PostgreSQL storage backend (server deployments).

pub mod schema;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::domain::{AttrValue, Conversation, Span, StatusCode};
use crate::error::StoreError;
use crate::store::dialect::group_id_expr;
use crate::store::postgres_dialect::PostgresDialect;
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

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(8).connect(dsn).await.map_err(StoreError::postgres)?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
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

    fn row_to_span(row: &sqlx::postgres::PgRow) -> Result<Span, StoreError> {
        let attributes_raw: serde_json::Value = row.try_get("attributes_json").map_err(StoreError::postgres)?;
        let events_raw: serde_json::Value = row.try_get("events_json").map_err(StoreError::postgres)?;
        Ok(Span {
            span_id: row.try_get("span_id").map_err(StoreError::postgres)?,
            trace_id: row.try_get("trace_id").map_err(StoreError::postgres)?,
            parent_span_id: row.try_get("parent_span_id").map_err(StoreError::postgres)?,
            name: row.try_get("name").map_err(StoreError::postgres)?,
            start_time_unix_nano: row.try_get("start_time").map_err(StoreError::postgres)?,
            end_time_unix_nano: row.try_get("end_time").map_err(StoreError::postgres)?,
            status_code: Self::status_code_from_text(&row.try_get::<String, _>("status_code").map_err(StoreError::postgres)?),
            status_description: row.try_get("status_description").map_err(StoreError::postgres)?,
            attributes_json: attributes_raw,
            events_json: events_raw,
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(schema::SCHEMA).execute(&self.pool).await.map_err(StoreError::postgres)?;
        Ok(())
    }

    async fn ingest(&self, batch: IngestBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::postgres)?;

        for span in &batch.spans {
            sqlx::query(
                "INSERT INTO spans (span_id, trace_id, parent_span_id, name, start_time, \
                 end_time, duration_ms, status_code, status_description, attributes_json, \
                 events_json) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::JSONB, $11::JSONB) \
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
            .await.map_err(StoreError::postgres)?;
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
                 int_val, float_val, bool_val, json_val) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::JSONB) \
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
            .await.map_err(StoreError::postgres)?;
        }

        for link in &batch.links {
            sqlx::query("DELETE FROM span_links WHERE span_id = $1")
                .bind(&link.span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::postgres)?;
            sqlx::query(
                "INSERT INTO span_links (span_id, trace_id, linked_trace_id, linked_span_id) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&link.span_id)
            .bind(&link.trace_id)
            .bind(&link.linked_trace_id)
            .bind(&link.linked_span_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::postgres)?;
        }

        for delta in &batch.conversation_deltas {
            let mut new_members = 0u64;
            for span_id in &delta.span_ids {
                let result = sqlx::query(
                    "INSERT INTO conversation_members (conversation_id, span_id) \
                     VALUES ($1, $2) ON CONFLICT DO NOTHING",
                )
                .bind(&delta.conversation_id)
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::postgres)?;
                new_members += result.rows_affected();
            }

            sqlx::query(
                "INSERT INTO conversations (id, first_start_time, last_end_time, span_count, \
                 model) VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT(id) DO UPDATE SET \
                   first_start_time = LEAST(conversations.first_start_time, excluded.first_start_time), \
                   last_end_time = GREATEST(conversations.last_end_time, excluded.last_end_time), \
                   span_count = conversations.span_count + $6, \
                   model = COALESCE(conversations.model, excluded.model)",
            )
            .bind(&delta.conversation_id)
            .bind(delta.first_start_time)
            .bind(delta.last_end_time)
            .bind(new_members as i64)
            .bind(&delta.model)
            .bind(new_members as i64)
            .execute(&mut *tx)
            .await.map_err(StoreError::postgres)?;
        }

        for (trace_id, conversation_id) in &batch.trace_conversation_ids {
            let mut case_when = String::new();
            for key in crate::normalize::CONVERSATION_KEY_PRIORITY {
                case_when.push_str(&format!("key = '{key}' OR "));
            }
            case_when.push_str("1 = 0");

            sqlx::query(&format!(
                "INSERT INTO span_attributes (span_id, trace_id, key, type, string_val) \
                 SELECT s.span_id, s.trace_id, 'conversation_id', 'string', $1 \
                 FROM spans s \
                 WHERE s.trace_id = $2 \
                 AND NOT EXISTS ( \
                   SELECT 1 FROM span_attributes sa \
                   WHERE sa.span_id = s.span_id AND ({case_when}) \
                 ) \
                 ON CONFLICT(span_id, key) DO UPDATE SET string_val = excluded.string_val"
            ))
            .bind(conversation_id)
            .bind(trace_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::postgres)?;
        }

        tx.commit().await.map_err(StoreError::postgres)?;
        Ok(())
    }

    async fn list_conversations(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let sql = if before.is_some() {
            "SELECT id, first_start_time, last_end_time, span_count, model FROM conversations \
             WHERE last_end_time < $1 ORDER BY last_end_time DESC LIMIT $2"
        } else {
            "SELECT id, first_start_time, last_end_time, span_count, model FROM conversations \
             ORDER BY last_end_time DESC LIMIT $1"
        };

        let rows = if let Some(before) = before {
            sqlx::query(sql)
                .bind(before)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await.map_err(StoreError::postgres)?
        } else {
            sqlx::query(sql).bind(limit as i64).fetch_all(&self.pool).await.map_err(StoreError::postgres)?
        };

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
        let expr = group_id_expr(&PostgresDialect, "spans");

        let sql = if q.is_some() {
            let ors: Vec<String> = SEARCH_COLUMNS
                .iter()
                .map(|c| format!("spans.{c}::TEXT ILIKE $2"))
                .collect();
            format!(
                "SELECT spans.span_id, spans.trace_id, spans.parent_span_id, spans.name, \
                 spans.start_time, spans.end_time, spans.status_code, spans.status_description, \
                 spans.attributes_json, spans.events_json FROM spans \
                 WHERE ({expr}) = $1 AND ({}) \
                 ORDER BY spans.start_time ASC, spans.span_id ASC LIMIT $3",
                ors.join(" OR ")
            )
        } else {
            format!(
                "SELECT spans.span_id, spans.trace_id, spans.parent_span_id, spans.name, \
                 spans.start_time, spans.end_time, spans.status_code, spans.status_description, \
                 spans.attributes_json, spans.events_json FROM spans \
                 WHERE ({expr}) = $1 \
                 ORDER BY spans.start_time ASC, spans.span_id ASC LIMIT $2"
            )
        };

        let rows = if let Some(q) = q {
            sqlx::query(&sql)
                .bind(conversation_id)
                .bind(format!("%{q}%"))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await.map_err(StoreError::postgres)?
        } else {
            sqlx::query(&sql)
                .bind(conversation_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await.map_err(StoreError::postgres)?
        };

        rows.iter().map(Self::row_to_span).collect()
    }

    async fn list_spans(&self, limit: u32, before: Option<i64>) -> Result<Vec<Span>, StoreError> {
        let sql = if before.is_some() {
            "SELECT span_id, trace_id, parent_span_id, name, start_time, end_time, status_code, \
             status_description, attributes_json, events_json FROM spans \
             WHERE start_time < $1 ORDER BY start_time DESC, span_id DESC LIMIT $2"
        } else {
            "SELECT span_id, trace_id, parent_span_id, name, start_time, end_time, status_code, \
             status_description, attributes_json, events_json FROM spans \
             ORDER BY start_time DESC, span_id DESC LIMIT $1"
        };

        let rows = if let Some(before) = before {
            sqlx::query(sql)
                .bind(before)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await.map_err(StoreError::postgres)?
        } else {
            sqlx::query(sql).bind(limit as i64).fetch_all(&self.pool).await.map_err(StoreError::postgres)?
        };

        rows.iter().map(Self::row_to_span).collect()
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::postgres)?;

        let expr = group_id_expr(&PostgresDialect, "spans");
        let span_ids: Vec<String> =
            sqlx::query(&format!("SELECT span_id FROM spans WHERE ({expr}) = $1"))
                .bind(conversation_id)
                .fetch_all(&mut *tx)
                .await.map_err(StoreError::postgres)?
                .iter()
                .map(|r| r.get::<String, _>("span_id"))
                .collect();

        let mut deleted = 0u64;
        for span_id in &span_ids {
            sqlx::query("DELETE FROM span_attributes WHERE span_id = $1")
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::postgres)?;
            sqlx::query("DELETE FROM span_links WHERE span_id = $1")
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::postgres)?;
            sqlx::query("DELETE FROM conversation_members WHERE span_id = $1")
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::postgres)?;
            let result = sqlx::query("DELETE FROM spans WHERE span_id = $1")
                .bind(span_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::postgres)?;
            deleted += result.rows_affected();
        }

        let remaining: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM conversation_members WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await.map_err(StoreError::postgres)?
        .get("n");

        if remaining == 0 {
            sqlx::query("DELETE FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::postgres)?;
        } else {
            sqlx::query("UPDATE conversations SET span_count = $1 WHERE id = $2")
                .bind(remaining)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await.map_err(StoreError::postgres)?;
        }

        tx.commit().await.map_err(StoreError::postgres)?;
        Ok(deleted)
    }

    async fn delete_trace(&self, trace_id: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::postgres)?;

        sqlx::query("DELETE FROM span_attributes WHERE trace_id = $1")
            .bind(trace_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::postgres)?;
        sqlx::query("DELETE FROM span_links WHERE trace_id = $1")
            .bind(trace_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::postgres)?;
        let result = sqlx::query("DELETE FROM spans WHERE trace_id = $1")
            .bind(trace_id)
            .execute(&mut *tx)
            .await.map_err(StoreError::postgres)?;

        tx.commit().await.map_err(StoreError::postgres)?;
        Ok(result.rows_affected())
    }
}

// No inline tests here: exercising this backend needs a live PostgreSQL
// instance, which this crate's test suite does not stand up. The SQLite
// backend (`store::sqlite`) carries the grouping/pagination/deletion test
// coverage shared by both backends' semantics.
