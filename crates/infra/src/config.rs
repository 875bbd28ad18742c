//! Configuration: key/value sources and the typed engine settings parsed from them.
//!
//! Values are stored as strings so the CLI can get/set them verbatim. Every
//! recognized key has a default; a key that was never set reads as its default.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use queuectl_core::RetryPolicy;

use crate::db::{map_sqlx_error, to_millis};
use crate::jobs::{JobStoreError, MIN_LEASE_TIMEOUT, ShellCommandRunner, StoreSettings, WorkerConfig};

/// Configuration error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: ConfigKey,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Recognized configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    MaxRetries,
    BackoffBaseMs,
    BackoffMaxMs,
    BackoffJitter,
    LeaseTimeoutMs,
    PollIntervalMs,
    CommandTimeoutMs,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 7] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBaseMs,
        ConfigKey::BackoffMaxMs,
        ConfigKey::BackoffJitter,
        ConfigKey::LeaseTimeoutMs,
        ConfigKey::PollIntervalMs,
        ConfigKey::CommandTimeoutMs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBaseMs => "backoff_base_ms",
            ConfigKey::BackoffMaxMs => "backoff_max_ms",
            ConfigKey::BackoffJitter => "backoff_jitter",
            ConfigKey::LeaseTimeoutMs => "lease_timeout_ms",
            ConfigKey::PollIntervalMs => "poll_interval_ms",
            ConfigKey::CommandTimeoutMs => "command_timeout_ms",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "3",
            ConfigKey::BackoffBaseMs => "1000",
            ConfigKey::BackoffMaxMs => "300000",
            ConfigKey::BackoffJitter => "0.1",
            ConfigKey::LeaseTimeoutMs => "30000",
            ConfigKey::PollIntervalMs => "500",
            ConfigKey::CommandTimeoutMs => "0",
        }
    }

    /// Check that `raw` parses for this key.
    pub fn validate(&self, raw: &str) -> Result<(), ConfigError> {
        match self {
            ConfigKey::MaxRetries => self.parse_u32(raw).map(|_| ()),
            ConfigKey::BackoffJitter => self.parse_ratio(raw).map(|_| ()),
            ConfigKey::CommandTimeoutMs | ConfigKey::BackoffMaxMs => {
                self.parse_millis(raw).map(|_| ())
            }
            ConfigKey::LeaseTimeoutMs => self.parse_lease(raw).map(|_| ()),
            ConfigKey::BackoffBaseMs | ConfigKey::PollIntervalMs => {
                self.parse_positive_millis(raw).map(|_| ())
            }
        }
    }

    fn invalid(&self, raw: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            key: *self,
            value: raw.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_u32(&self, raw: &str) -> Result<u32, ConfigError> {
        raw.trim()
            .parse::<u32>()
            .map_err(|e| self.invalid(raw, e.to_string()))
    }

    fn parse_millis(&self, raw: &str) -> Result<Duration, ConfigError> {
        raw.trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| self.invalid(raw, e.to_string()))
    }

    fn parse_positive_millis(&self, raw: &str) -> Result<Duration, ConfigError> {
        let d = self.parse_millis(raw)?;
        if d.is_zero() {
            return Err(self.invalid(raw, "must be greater than 0"));
        }
        Ok(d)
    }

    fn parse_lease(&self, raw: &str) -> Result<Duration, ConfigError> {
        let d = self.parse_millis(raw)?;
        if d < MIN_LEASE_TIMEOUT {
            return Err(self.invalid(
                raw,
                format!("must be at least {}", MIN_LEASE_TIMEOUT.as_millis()),
            ));
        }
        Ok(d)
    }

    fn parse_ratio(&self, raw: &str) -> Result<f64, ConfigError> {
        let v = raw
            .trim()
            .parse::<f64>()
            .map_err(|e| self.invalid(raw, e.to_string()))?;
        if !(0.0..=1.0).contains(&v) {
            return Err(self.invalid(raw, "must be between 0 and 1"));
        }
        Ok(v)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

/// Key → string lookup.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Stored value, or `None` if the key was never set.
    async fn get(&self, key: ConfigKey) -> Result<Option<String>, ConfigError>;
}

#[async_trait]
impl ConfigSource for HashMap<String, String> {
    async fn get(&self, key: ConfigKey) -> Result<Option<String>, ConfigError> {
        Ok(HashMap::get(self, key.as_str()).cloned())
    }
}

/// Typed engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: f64,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    /// `None` means unlimited.
    pub command_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            backoff_jitter: 0.1,
            lease_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            command_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Read every key from `source`, falling back to defaults for unset keys.
    pub async fn load(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        async fn value(source: &dyn ConfigSource, key: ConfigKey) -> Result<String, ConfigError> {
            Ok(source
                .get(key)
                .await?
                .unwrap_or_else(|| key.default_value().to_string()))
        }

        let command_timeout = ConfigKey::CommandTimeoutMs
            .parse_millis(&value(source, ConfigKey::CommandTimeoutMs).await?)?;

        Ok(Self {
            max_retries: ConfigKey::MaxRetries
                .parse_u32(&value(source, ConfigKey::MaxRetries).await?)?,
            backoff_base: ConfigKey::BackoffBaseMs
                .parse_positive_millis(&value(source, ConfigKey::BackoffBaseMs).await?)?,
            backoff_max: ConfigKey::BackoffMaxMs
                .parse_millis(&value(source, ConfigKey::BackoffMaxMs).await?)?,
            backoff_jitter: ConfigKey::BackoffJitter
                .parse_ratio(&value(source, ConfigKey::BackoffJitter).await?)?,
            lease_timeout: ConfigKey::LeaseTimeoutMs
                .parse_lease(&value(source, ConfigKey::LeaseTimeoutMs).await?)?,
            poll_interval: ConfigKey::PollIntervalMs
                .parse_positive_millis(&value(source, ConfigKey::PollIntervalMs).await?)?,
            command_timeout: (!command_timeout.is_zero()).then_some(command_timeout),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.backoff_base, self.backoff_max, self.backoff_jitter)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            retry: self.retry_policy(),
            default_max_retries: self.max_retries,
            lease_timeout: self.lease_timeout,
        }
    }

    /// Worker settings; `poll_interval` overrides the configured one.
    pub fn worker_config(&self, poll_interval: Option<Duration>) -> WorkerConfig {
        WorkerConfig::for_lease(
            poll_interval.unwrap_or(self.poll_interval),
            self.lease_timeout,
        )
    }

    pub fn command_runner(&self) -> ShellCommandRunner {
        ShellCommandRunner::new().with_timeout(self.command_timeout)
    }
}

/// One row of `config list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    pub key: ConfigKey,
    pub value: String,
    /// `false` when the value is the built-in default.
    pub is_set: bool,
}

/// Configuration persisted in the `config` table of the job database.
#[derive(Debug, Clone)]
pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl SqliteConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Effective value: stored, else default.
    pub async fn effective(&self, key: ConfigKey) -> Result<String, ConfigError> {
        Ok(self
            .get(key)
            .await?
            .unwrap_or_else(|| key.default_value().to_string()))
    }

    /// Validate and persist `value` for `key`.
    pub async fn set(&self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        key.validate(value)?;
        let value = value.trim();

        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key.as_str())
        .bind(value)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("config_set", e))?;

        info!(%key, value, "config updated");
        Ok(())
    }

    /// Every recognized key with its effective value.
    pub async fn list(&self) -> Result<Vec<ConfigEntry>, ConfigError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("config_list", e))?;
        let stored: HashMap<String, String> = rows.into_iter().collect();

        Ok(ConfigKey::ALL
            .into_iter()
            .map(|key| match stored.get(key.as_str()) {
                Some(value) => ConfigEntry {
                    key,
                    value: value.clone(),
                    is_set: true,
                },
                None => ConfigEntry {
                    key,
                    value: key.default_value().to_string(),
                    is_set: false,
                },
            })
            .collect())
    }
}

#[async_trait]
impl ConfigSource for SqliteConfigStore {
    async fn get(&self, key: ConfigKey) -> Result<Option<String>, ConfigError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("config_get", e))?;
        Ok(row.map(|(v,)| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn empty_source_yields_defaults() {
        let config = EngineConfig::load(&HashMap::<String, String>::new()).await.unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn values_are_parsed() {
        let src = source(&[
            ("max_retries", "5"),
            ("backoff_base_ms", "250"),
            ("backoff_jitter", "0"),
            ("command_timeout_ms", "1500"),
            ("unrelated", "ignored"),
        ]);
        let config = EngineConfig::load(&src).await.unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.command_timeout, Some(Duration::from_millis(1500)));

        let settings = config.store_settings();
        assert_eq!(settings.default_max_retries, 5);
        assert_eq!(settings.retry.backoff(3), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn malformed_values_are_rejected() {
        for (key, value) in [
            ("max_retries", "-1"),
            ("backoff_base_ms", "0"),
            ("backoff_jitter", "1.5"),
            ("lease_timeout_ms", "soon"),
            ("lease_timeout_ms", "5"),
            ("lease_timeout_ms", "99"),
        ] {
            let err = EngineConfig::load(&source(&[(key, value)])).await.unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { .. }),
                "{key}={value} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn lease_floor_keeps_heartbeat_inside_the_lease() {
        assert!(ConfigKey::LeaseTimeoutMs.validate("0").is_err());
        assert!(ConfigKey::LeaseTimeoutMs.validate("29").is_err());
        ConfigKey::LeaseTimeoutMs.validate("100").unwrap();

        let config = EngineConfig::load(&source(&[("lease_timeout_ms", "100")]))
            .await
            .unwrap();
        let worker = config.worker_config(Some(Duration::from_secs(5)));
        assert!(worker.heartbeat_interval < config.lease_timeout);
    }

    #[test]
    fn keys_round_trip_through_strings() {
        for key in ConfigKey::ALL {
            assert_eq!(key.as_str().parse::<ConfigKey>().unwrap(), key);
            key.validate(key.default_value()).unwrap();
        }
        assert!(matches!(
            "nope".parse::<ConfigKey>(),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn sqlite_store_persists_values() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::open(&dir.path().join("queue.db")).await.unwrap();
        let store = SqliteConfigStore::new(pool);

        assert_eq!(store.get(ConfigKey::MaxRetries).await.unwrap(), None);
        assert_eq!(store.effective(ConfigKey::MaxRetries).await.unwrap(), "3");

        store.set(ConfigKey::MaxRetries, "7").await.unwrap();
        store.set(ConfigKey::MaxRetries, " 8 ").await.unwrap();
        assert_eq!(store.get(ConfigKey::MaxRetries).await.unwrap().as_deref(), Some("8"));
        assert!(store.set(ConfigKey::BackoffJitter, "lots").await.is_err());

        let entries = store.list().await.unwrap();
        assert_eq!(entries.len(), ConfigKey::ALL.len());
        let max = entries.iter().find(|e| e.key == ConfigKey::MaxRetries).unwrap();
        assert!(max.is_set);
        assert_eq!(max.value, "8");

        let config = EngineConfig::load(&store).await.unwrap();
        assert_eq!(config.max_retries, 8);
    }
}
