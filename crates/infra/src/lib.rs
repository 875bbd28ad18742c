//! Infrastructure layer: SQLite persistence, command execution, workers, config.

pub mod config;
pub mod db;
pub mod jobs;
pub mod queue;


pub use config::{ConfigEntry, ConfigError, ConfigKey, ConfigSource, EngineConfig, SqliteConfigStore};
pub use db::{default_database_path, DB_PATH_ENV};
pub use queue::JobQueue;
