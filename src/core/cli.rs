//! Command-line interface
//!
//! Per the external interface contract this crate has exactly one flag:
//! `--log-level`, which overrides the `LOG_LEVEL` environment variable.

use clap::Parser;

use super::constants::{APP_NAME, ENV_LOG_LEVEL};

#[derive(Parser, Debug)]
#[command(name = APP_NAME)]
#[command(version, about = "OTLP ingestion backend that groups spans into conversations")]
pub struct Cli {
    /// Log level (DEBUG, INFO, WARN, ERROR). Overrides LOG_LEVEL.
    #[arg(long, env = ENV_LOG_LEVEL)]
    pub log_level: Option<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
