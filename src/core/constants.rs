//! Application-wide constants
//!
//! Env var names, defaults, and the pagination limits from the external
//! interface contract, grouped the way the server's own config constants
//! are grouped.

// --- Application identity ---
pub const APP_NAME: &str = "simple-traces";

// --- Server ---
pub const ENV_PORT: &str = "PORT";
pub const DEFAULT_PORT: u16 = 8080;

// --- Storage ---
pub const ENV_DB_TYPE: &str = "DB_TYPE";
pub const ENV_DB_CONNECTION: &str = "DB_CONNECTION";
pub const DEFAULT_DB_TYPE: &str = "sqlite";
pub const DEFAULT_SQLITE_PATH: &str = "simple-traces.db";

// --- Logging ---
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

// --- OTLP ---
pub const ENV_OTLP_ENABLED: &str = "OTLP_ENABLED";
pub const ENV_OTLP_ENDPOINT: &str = "OTLP_ENDPOINT";

// --- Pagination (spec §4.4) ---
pub const CONVERSATIONS_DEFAULT_LIMIT: u32 = 100;
pub const CONVERSATIONS_MAX_LIMIT: u32 = 1000;
pub const TRACE_GROUP_DEFAULT_LIMIT: u32 = 1000;
pub const TRACE_GROUP_MAX_LIMIT: u32 = 5000;
pub const SPANS_DEFAULT_LIMIT: u32 = 100;
pub const SPANS_MAX_LIMIT: u32 = 1000;

// --- JSONL import ---
pub const IMPORT_MAX_LINE_BYTES: usize = 10 * 1024 * 1024;
