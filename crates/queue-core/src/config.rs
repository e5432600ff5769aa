//! Declarative Queue configuration.

use std::env;
use std::time::Duration;

/// Concurrency Accountant mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyLimit {
    /// Ignore owner/group counters entirely.
    Off,
    /// Enforce `owner_concurrency.max_concurrency` only.
    #[default]
    PerOwner,
    /// Enforce both the owner's cap and, if set, the group's cap.
    PerOwnerPerGroup,
}

impl ConcurrencyLimit {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "off" => Ok(Self::Off),
            "per-owner" => Ok(Self::PerOwner),
            "per-owner-per-group" => Ok(Self::PerOwnerPerGroup),
            other => Err(ConfigError::InvalidValue {
                key: "CONCURRENCY_LIMIT",
                value: other.to_string(),
            }),
        }
    }
}

/// `WaitForJob` backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    #[default]
    Poll,
    Listen,
}

impl WaitMode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "poll" => Ok(Self::Poll),
            "listen" => Ok(Self::Listen),
            other => Err(ConfigError::InvalidValue {
                key: "WAIT_MODE",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Queue configuration, assembled once at startup from the process
/// environment. `bus_url` being present upgrades `wait_mode` to `Listen`
/// automatically unless the caller pinned `WAIT_MODE` explicitly.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_name: String,
    pub database_url: String,
    pub bus_url: Option<String>,
    pub concurrency_limit: ConcurrencyLimit,
    pub wait_mode: WaitMode,
    pub lease_ttl_ms: i64,
    pub prefetch_batch: i64,
    pub channel_id: String,
}

impl QueueConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms.max(0) as u64)
    }

    /// Load configuration from the process environment, having first loaded
    /// a local `.env` file if present (mirrors the `dotenvy` usage shared by
    /// this repository's sibling services).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let queue_name = env::var("QUEUE_NAME").unwrap_or_else(|_| "scrape".to_string());
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let bus_url = env::var("QUEUE_BUS_URL").ok().filter(|s| !s.is_empty());

        let concurrency_limit = match env::var("CONCURRENCY_LIMIT") {
            Ok(raw) => ConcurrencyLimit::parse(&raw)?,
            Err(_) => ConcurrencyLimit::default(),
        };

        let wait_mode = match env::var("WAIT_MODE") {
            Ok(raw) => WaitMode::parse(&raw)?,
            Err(_) if bus_url.is_some() => WaitMode::Listen,
            Err(_) => WaitMode::default(),
        };

        let lease_ttl_ms = parse_env_or("LEASE_TTL_MS", 60_000)?;
        let prefetch_batch = parse_env_or("PREFETCH_BATCH", 100)?;
        let channel_id = env::var("CHANNEL_ID").unwrap_or_else(|_| "main".to_string());

        Ok(Self {
            queue_name,
            database_url,
            bus_url,
            concurrency_limit,
            wait_mode,
            lease_ttl_ms,
            prefetch_batch,
            channel_id,
        })
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}
