//! PostgreSQL SQL dialect implementation.

use super::dialect::SqlDialect;

pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("{col}::TEXT")
    }

    fn now_nanos(&self) -> &'static str {
        "(EXTRACT(EPOCH FROM NOW())::BIGINT * 1000000000)"
    }

    fn order_by_with_nulls(&self, col: &str, desc: bool, nulls_last: bool) -> String {
        let dir = if desc { "DESC" } else { "ASC" };
        let nulls = if nulls_last { "NULLS LAST" } else { "NULLS FIRST" };
        format!("{col} {dir} {nulls}")
    }
}
