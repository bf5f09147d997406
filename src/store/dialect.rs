//! SQL dialect trait for multi-database support.
//!
//! Different databases speak slightly different SQL for the same
//! operation; each concrete store owns exactly one of these.

use crate::normalize::CONVERSATION_KEY_PRIORITY;

pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parameter placeholder for the given 1-based index.
    fn placeholder(&self, index: usize) -> String;

    /// Cast a column to string/text.
    fn cast_to_string(&self, col: &str) -> String;

    /// Current UTC time as a nanosecond epoch integer expression.
    fn now_nanos(&self) -> &'static str;

    /// `ORDER BY` clause fragment with explicit NULL placement.
    fn order_by_with_nulls(&self, col: &str, desc: bool, nulls_last: bool) -> String;
}

/// Builds the group-id SQL expression (spec §4.4): for each priority key in
/// turn, the first non-empty of `string_val`, then `int_val` cast to text,
/// then `float_val` cast to text for *that key*, before moving on to the
/// next key; else the span's own `trace_id`. Key-major, matching the
/// Rust-side scan order in `normalize::derive_conversation_key` (spec §4.2:
/// "scan keys in this exact priority order, taking the first whose value
/// is non-empty") — a key stored as e.g. `int_val` still outranks a
/// lower-priority key stored as `string_val`. Built from
/// `normalize::CONVERSATION_KEY_PRIORITY` directly so the SQL and the
/// Rust-side derivation can never drift apart.
pub fn group_id_expr(dialect: &dyn SqlDialect, span_alias: &str) -> String {
    let mut subqueries = Vec::new();

    for key in CONVERSATION_KEY_PRIORITY {
        subqueries.push(format!(
            "(SELECT sa.string_val FROM span_attributes sa \
             WHERE sa.span_id = {span_alias}.span_id AND sa.key = '{key}' \
             AND sa.string_val IS NOT NULL AND sa.string_val <> '' LIMIT 1)"
        ));
        subqueries.push(format!(
            "(SELECT {cast} FROM span_attributes sa \
             WHERE sa.span_id = {span_alias}.span_id AND sa.key = '{key}' \
             AND sa.int_val IS NOT NULL LIMIT 1)",
            cast = dialect.cast_to_string("sa.int_val")
        ));
        subqueries.push(format!(
            "(SELECT {cast} FROM span_attributes sa \
             WHERE sa.span_id = {span_alias}.span_id AND sa.key = '{key}' \
             AND sa.float_val IS NOT NULL LIMIT 1)",
            cast = dialect.cast_to_string("sa.float_val")
        ));
    }

    format!(
        "COALESCE({}, {}.trace_id)",
        subqueries.join(", "),
        span_alias
    )
}
