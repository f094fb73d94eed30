//! Engine configuration, loaded from TOML or `CONDUCTOR_*` environment variables.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::TickCaps;

pub const ENV_PREFIX: &str = "CONDUCTOR_";
pub const MEMORY_DATABASE: &str = ":memory:";
/// Upper bound for `lease_ttl_secs`: one day.
pub const MAX_LEASE_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {message}")]
    Read { path: String, message: String },
    #[error("parse config: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file, or `:memory:`.
    pub database_path: String,
    pub busy_timeout_ms: u64,
    pub lease_ttl_secs: i64,
    /// Base directory of the filesystem artifact writer.
    pub artifact_dir: PathBuf,
    /// Per-run buffer of live event subscriptions.
    pub event_channel_capacity: usize,
    pub default_caps: TickCaps,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: MEMORY_DATABASE.to_string(),
            busy_timeout_ms: 5_000,
            lease_ttl_secs: 30,
            artifact_dir: PathBuf::from("artifacts"),
            event_channel_capacity: 256,
            default_caps: TickCaps::default(),
        }
    }
}

impl EngineConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults overridden by `CONDUCTOR_*` variables of the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars())
    }

    /// Defaults overridden by the `CONDUCTOR_*` entries of `vars`; other
    /// entries are ignored.
    pub fn from_env_map<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "DATABASE_PATH" | "SQLITE_DB" => config.database_path = value.to_string(),
                "BUSY_TIMEOUT_MS" => config.busy_timeout_ms = parse_env(key.as_ref(), value)?,
                "LEASE_TTL_SECS" => config.lease_ttl_secs = parse_env(key.as_ref(), value)?,
                "ARTIFACT_DIR" => config.artifact_dir = PathBuf::from(value),
                "EVENT_CHANNEL_CAPACITY" => {
                    config.event_channel_capacity = parse_env(key.as_ref(), value)?
                }
                "MAX_TOTAL_TICKS_PER_INVOCATION" => {
                    config.default_caps.max_total_ticks_per_invocation =
                        parse_env(key.as_ref(), value)?
                }
                "MAX_TICKS_PER_RUN_PER_INVOCATION" => {
                    config.default_caps.max_ticks_per_run_per_invocation =
                        parse_env(key.as_ref(), value)?
                }
                "DAILY_TICK_CAP" => {
                    config.default_caps.daily_tick_cap = if value.is_empty() {
                        None
                    } else {
                        Some(parse_env(key.as_ref(), value)?)
                    }
                }
                "RETRY_ON_LEASE_CONFLICT" => {
                    config.default_caps.retry_on_lease_conflict = parse_env(key.as_ref(), value)?
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.trim().is_empty() {
            return Err(invalid("database_path", "must not be empty"));
        }
        if self.lease_ttl_secs <= 0 {
            return Err(invalid("lease_ttl_secs", "must be positive"));
        }
        if self.lease_ttl_secs > MAX_LEASE_TTL_SECS {
            return Err(invalid(
                "lease_ttl_secs",
                &format!("must be at most {}", MAX_LEASE_TTL_SECS),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity", "must be at least 1"));
        }
        self.default_caps
            .validate()
            .map_err(|e| invalid("default_caps", &e.to_string()))
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path == MEMORY_DATABASE
    }

    /// Lease TTL, clamped to `1..=MAX_LEASE_TTL_SECS` for unvalidated configs.
    pub fn lease_ttl(&self) -> Duration {
        let secs = self.lease_ttl_secs.clamp(1, MAX_LEASE_TTL_SECS);
        Duration::try_seconds(secs).unwrap_or_else(Duration::zero)
    }

    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_timeout_ms)
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(key, &e.to_string()))
}
