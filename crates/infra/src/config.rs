//! Process configuration, read from the environment.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use shelfsync_events::{ExponentialBackoff, FailurePolicy, NoRetry, ReconnectPolicy, ServiceRole};

pub const DEFAULT_EXCHANGE: &str = "library_events";
const DEFAULT_BLOCK_MS: u64 = 1000;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Everything a node needs to join replication.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationConfig {
    pub broker_url: String,
    pub role: ServiceRole,
    pub exchange: String,
    pub failure_policy: FailurePolicy,
    /// How long a consumer blocks waiting for new messages per read.
    pub consumer_block: Duration,
    /// 0 disables reconnection retries.
    pub reconnect_max_attempts: u32,
    /// Postgres repositories when set, in-memory otherwise.
    pub database_url: Option<String>,
}

impl ReplicationConfig {
    /// Minimal config with defaults for everything but the broker URL.
    pub fn new(broker_url: impl Into<String>, role: ServiceRole) -> Self {
        Self {
            broker_url: broker_url.into(),
            role,
            exchange: DEFAULT_EXCHANGE.to_string(),
            failure_policy: FailurePolicy::default(),
            consumer_block: Duration::from_millis(DEFAULT_BLOCK_MS),
            reconnect_max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            database_url: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let broker_url = get("BROKER_URL")
            .or_else(|| get("REDIS_URL"))
            .ok_or(ConfigError::Missing("BROKER_URL"))?;

        let role = match get("SERVICE_ROLE") {
            Some(raw) => raw
                .parse::<ServiceRole>()
                .map_err(|reason| ConfigError::Invalid { var: "SERVICE_ROLE", reason })?,
            None => ServiceRole::Frontend,
        };

        let mut config = Self::new(broker_url, role);

        if let Some(exchange) = get("EXCHANGE_NAME") {
            config.exchange = exchange.trim().to_string();
        }
        if let Some(raw) = get("FAILURE_POLICY") {
            config.failure_policy = raw
                .parse()
                .map_err(|reason| ConfigError::Invalid { var: "FAILURE_POLICY", reason })?;
        }
        if let Some(raw) = get("CONSUMER_BLOCK_MS") {
            let ms: u64 = parse_number("CONSUMER_BLOCK_MS", &raw)?;
            config.consumer_block = Duration::from_millis(ms);
        }
        if let Some(raw) = get("RECONNECT_MAX_ATTEMPTS") {
            config.reconnect_max_attempts = parse_number("RECONNECT_MAX_ATTEMPTS", &raw)?;
        }
        config.database_url = get("DATABASE_URL");

        Ok(config)
    }

    pub fn reconnect_policy(&self) -> Arc<dyn ReconnectPolicy> {
        if self.reconnect_max_attempts == 0 {
            Arc::new(NoRetry)
        } else {
            Arc::new(ExponentialBackoff::default().with_max_attempts(self.reconnect_max_attempts))
        }
    }
}

fn parse_number<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid { var, reason: e.to_string() })
}
