//! Application configuration, resolved from environment variables with the
//! one CLI override the external interface contract allows.

use std::fmt;

use crate::error::StoreError;

use super::cli::Cli;
use super::constants::{
    DEFAULT_DB_TYPE, DEFAULT_LOG_LEVEL, DEFAULT_PORT, DEFAULT_SQLITE_PATH, ENV_DB_CONNECTION,
    ENV_DB_TYPE, ENV_LOG_LEVEL, ENV_OTLP_ENABLED, ENV_OTLP_ENDPOINT, ENV_PORT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Sqlite,
    Postgres,
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

impl std::str::FromStr for DbType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(StoreError::config(format!(
                "invalid {ENV_DB_TYPE} '{other}'. Valid options: sqlite, postgres, postgresql"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_type: DbType,
    pub db_connection: String,
    pub log_level: String,
    pub otlp_enabled: bool,
    pub otlp_endpoint: Option<String>,
}

fn is_truthy(s: &str) -> bool {
    matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

impl AppConfig {
    pub fn load(cli: &Cli) -> Result<Self, StoreError> {
        let port = match std::env::var(ENV_PORT) {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|_| StoreError::config(format!("invalid {ENV_PORT} '{v}'")))?,
            Err(_) => DEFAULT_PORT,
        };

        let db_type_raw =
            std::env::var(ENV_DB_TYPE).unwrap_or_else(|_| DEFAULT_DB_TYPE.to_string());
        let db_type: DbType = db_type_raw.parse()?;

        let db_connection = std::env::var(ENV_DB_CONNECTION)
            .unwrap_or_else(|_| DEFAULT_SQLITE_PATH.to_string());

        let log_level = cli
            .log_level
            .clone()
            .or_else(|| std::env::var(ENV_LOG_LEVEL).ok())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let otlp_enabled = std::env::var(ENV_OTLP_ENABLED)
            .map(|v| is_truthy(&v))
            .unwrap_or(true);

        let otlp_endpoint = std::env::var(ENV_OTLP_ENDPOINT).ok();

        Ok(Self {
            port,
            db_type,
            db_connection,
            log_level,
            otlp_enabled,
            otlp_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_db_type_parses_known_values() {
        assert_eq!("sqlite".parse::<DbType>().unwrap(), DbType::Sqlite);
        assert_eq!("postgres".parse::<DbType>().unwrap(), DbType::Postgres);
        assert_eq!("postgresql".parse::<DbType>().unwrap(), DbType::Postgres);
        assert_eq!("SQLITE".parse::<DbType>().unwrap(), DbType::Sqlite);
    }

    #[test]
    fn test_db_type_rejects_unknown_value() {
        assert!("mysql".parse::<DbType>().is_err());
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(is_truthy("YES"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_load_uses_defaults_when_env_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        for var in [ENV_PORT, ENV_DB_TYPE, ENV_DB_CONNECTION, ENV_LOG_LEVEL, ENV_OTLP_ENABLED] {
            unsafe { std::env::remove_var(var) };
        }
        let cli = Cli { log_level: None };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.db_type, DbType::Sqlite);
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert!(config.otlp_enabled);
    }

    #[test]
    fn test_cli_log_level_overrides_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var(ENV_LOG_LEVEL, "WARN") };
        let cli = Cli {
            log_level: Some("DEBUG".to_string()),
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.log_level, "DEBUG");
        unsafe { std::env::remove_var(ENV_LOG_LEVEL) };
    }
}
