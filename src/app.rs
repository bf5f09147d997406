//! Application bootstrap: config → store → logging → server (spec §5, §6).
//!
//! Trimmed from the teacher's `CoreApp` (`app.rs`): no auth, cache, file
//! storage, secrets, background tasks, or topics — spec §5 rules out
//! internal task queues and background workers for this service.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::core::cli;
use crate::core::config::{AppConfig, DbType};
use crate::store::postgres::PostgresStore;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

pub struct App {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
}

impl App {
    /// Parses CLI args/env, connects the configured backend, creates the
    /// schema, and serves until the process is killed. Exits 1 on
    /// bootstrap failure (spec §6: "Exit 1 on bootstrap failure").
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();

        let cli = cli::parse();
        let config = AppConfig::load(&cli).context("failed to load configuration")?;

        Self::init_logging(&config.log_level);
        tracing::info!(
            db_type = %config.db_type,
            port = config.port,
            otlp_enabled = config.otlp_enabled,
            otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("-"),
            "starting"
        );

        let app = Self::init(config).await?;
        crate::api::serve(app.store.clone(), app.config.port).await
    }

    async fn init(config: AppConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match config.db_type {
            DbType::Sqlite => {
                ensure_parent_dir(&config.db_connection)
                    .context("failed to create SQLite data directory")?;
                Arc::new(
                    SqliteStore::connect(&config.db_connection)
                        .await
                        .context("failed to connect to SQLite")?,
                )
            }
            DbType::Postgres => Arc::new(
                PostgresStore::connect(&config.db_connection)
                    .await
                    .context("failed to connect to Postgres")?,
            ),
        };

        store.init_schema().await.context("failed to initialize schema")?;

        Ok(Self { config, store })
    }

    /// Matches the teacher's `CoreApp::init_logging` (compact formatter,
    /// no target/thread-id noise), driven by the resolved `LOG_LEVEL`
    /// instead of a hardcoded per-crate directive.
    fn init_logging(log_level: &str) {
        let filter = format!("{},{}={}", log_level.to_lowercase(), crate::core::constants::APP_NAME, log_level.to_lowercase());
        let filter = std::env::var("RUST_LOG").unwrap_or(filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }
}

/// The embedded backend's persisted layout creates the parent directory
/// with `0755` when missing (spec §6).
fn ensure_parent_dir(path: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o755);
                std::fs::set_permissions(parent, perms)?;
            }
        }
    }
    Ok(())
}
