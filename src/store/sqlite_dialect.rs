//! SQLite SQL dialect implementation.

use super::dialect::SqlDialect;

pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("CAST({col} AS TEXT)")
    }

    fn now_nanos(&self) -> &'static str {
        "CAST((julianday('now') - 2440587.5) * 86400000000000 AS INTEGER)"
    }

    fn order_by_with_nulls(&self, col: &str, desc: bool, nulls_last: bool) -> String {
        let dir = if desc { "DESC" } else { "ASC" };
        if nulls_last {
            format!("CASE WHEN {col} IS NULL THEN 1 ELSE 0 END, {col} {dir}")
        } else {
            format!("CASE WHEN {col} IS NULL THEN 0 ELSE 1 END, {col} {dir}")
        }
    }
}
