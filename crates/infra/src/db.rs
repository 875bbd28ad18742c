//! SQLite connection pool, schema, and error mapping.
//!
//! One database file holds the `jobs` table, the worker liveness registry,
//! the key/value `config` table, and the `control` table used for
//! cross-process stop requests. Timestamps are integer milliseconds since the
//! Unix epoch so that ordering and range comparisons happen in SQL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::debug;

use crate::jobs::JobStoreError;

/// Environment variable overriding the database location.
pub const DB_PATH_ENV: &str = "QUEUECTL_DB";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id           TEXT PRIMARY KEY NOT NULL,
        command      TEXT NOT NULL,
        state        TEXT NOT NULL
                     CHECK (state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
        run_at       INTEGER NOT NULL,
        attempts     INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_retries  INTEGER NOT NULL CHECK (max_retries >= 0),
        last_error   TEXT NULL,
        claimed_by   TEXT NULL,
        claim_token  TEXT NULL,
        created_at   INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, run_at, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        id            TEXT PRIMARY KEY NOT NULL,
        pid           INTEGER NOT NULL,
        heartbeat_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key         TEXT PRIMARY KEY NOT NULL,
        value       TEXT NOT NULL,
        updated_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS control (
        name   TEXT PRIMARY KEY NOT NULL,
        value  INTEGER NOT NULL
    )
    "#,
];

/// Resolve the database file: `$QUEUECTL_DB`, else the platform data dir,
/// else `./.queuectl/queue.db`.
pub fn default_database_path() -> PathBuf {
    if let Some(path) = std::env::var_os(DB_PATH_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    match dirs::data_local_dir() {
        Some(dir) => dir.join("queuectl").join("queue.db"),
        None => PathBuf::from(".queuectl").join("queue.db"),
    }
}

/// Open (creating if missing) the database at `path` and ensure the schema.
pub async fn open(path: &Path) -> Result<SqlitePool, JobStoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            JobStoreError::Unavailable(format!(
                "failed to create database directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    init_schema(&pool).await?;
    debug!(path = %path.display(), "job database ready");
    Ok(pool)
}

/// Create tables and indexes if they do not exist yet. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), JobStoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("init_schema", e))?;
    }
    Ok(())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| JobStoreError::Unavailable(format!("timestamp out of range: {ms}")))
}

pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Map sqlx failures onto the store taxonomy. Anything the caller cannot fix
/// by changing its input is `Unavailable`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            if db_err.is_check_violation() {
                JobStoreError::Validation(msg)
            } else {
                JobStoreError::Unavailable(msg)
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        _ => JobStoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
