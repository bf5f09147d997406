pub mod cli;
pub mod config;
pub mod constants;

pub use cli::Cli;
pub use config::AppConfig;
