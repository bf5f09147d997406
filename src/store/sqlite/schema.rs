//! SQLite schema for the embedded backend.

pub const SCHEMA_VERSION: i32 = 1;

pub const SCHEMA: &str = r#"
-- === SPANS ========================================================== --
CREATE TABLE IF NOT EXISTS spans (
    span_id             TEXT PRIMARY KEY,
    trace_id            TEXT NOT NULL,
    parent_span_id      TEXT,
    name                TEXT NOT NULL,
    start_time          INTEGER NOT NULL,
    end_time            INTEGER NOT NULL,
    duration_ms         INTEGER NOT NULL,
    status_code         TEXT NOT NULL,
    status_description  TEXT,
    attributes_json     TEXT NOT NULL DEFAULT '{}',
    events_json         TEXT NOT NULL DEFAULT '[]',
    UNIQUE (trace_id, span_id)
);
CREATE INDEX IF NOT EXISTS idx_spans_trace_id ON spans (trace_id);
CREATE INDEX IF NOT EXISTS idx_spans_start_time ON spans (start_time DESC, span_id DESC);
CREATE INDEX IF NOT EXISTS idx_spans_name ON spans (name);

-- === SPAN ATTRIBUTES ================================================= --
CREATE TABLE IF NOT EXISTS span_attributes (
    span_id    TEXT NOT NULL,
    trace_id   TEXT NOT NULL,
    key        TEXT NOT NULL,
    type       TEXT NOT NULL,
    string_val TEXT,
    int_val    INTEGER,
    float_val  REAL,
    bool_val   INTEGER,
    json_val   TEXT,
    PRIMARY KEY (span_id, key)
);
CREATE INDEX IF NOT EXISTS idx_span_attributes_trace_id ON span_attributes (trace_id);
CREATE INDEX IF NOT EXISTS idx_span_attributes_key ON span_attributes (key);

-- === SPAN LINKS ======================================================= --
CREATE TABLE IF NOT EXISTS span_links (
    span_id         TEXT NOT NULL,
    trace_id        TEXT NOT NULL,
    linked_trace_id TEXT NOT NULL,
    linked_span_id  TEXT
);
CREATE INDEX IF NOT EXISTS idx_span_links_span_id ON span_links (span_id);
CREATE INDEX IF NOT EXISTS idx_span_links_linked_trace_id ON span_links (linked_trace_id);

-- === CONVERSATIONS ==================================================== --
CREATE TABLE IF NOT EXISTS conversations (
    id               TEXT PRIMARY KEY,
    first_start_time INTEGER NOT NULL,
    last_end_time    INTEGER NOT NULL,
    span_count       INTEGER NOT NULL DEFAULT 0,
    model            TEXT
);
CREATE INDEX IF NOT EXISTS idx_conversations_last_end_time ON conversations (last_end_time DESC);

-- === CONVERSATION MEMBERS (dedup for span_count, see DESIGN.md) ===== --
CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id TEXT NOT NULL,
    span_id         TEXT NOT NULL,
    PRIMARY KEY (conversation_id, span_id)
);
"#;
