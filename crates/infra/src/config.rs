//! Configuration loading and representation.
//!
//! Values come from environment variables with defaults. Components receive
//! their configuration at construction; nothing here is global.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use paystate_events::DEFAULT_MAX_OUTBOX_RETRIES;

pub const DATABASE_URL: &str = "PAYSTATE_DATABASE_URL";
pub const FALLBACK_DATABASE_URL: &str = "DATABASE_URL";
pub const MAX_CONNECTIONS: &str = "PAYSTATE_MAX_CONNECTIONS";
pub const OPERATION_TIMEOUT_MS: &str = "PAYSTATE_OPERATION_TIMEOUT_MS";
pub const MAX_OUTBOX_RETRIES: &str = "PAYSTATE_MAX_OUTBOX_RETRIES";
pub const OUTBOX_POLL_LIMIT: &str = "PAYSTATE_OUTBOX_POLL_LIMIT";
pub const OUTBOX_POLL_INTERVAL_MS: &str = "PAYSTATE_OUTBOX_POLL_INTERVAL_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Relational store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Deadline applied to every storage operation.
    pub operation_timeout: Duration,
    pub max_outbox_retries: u32,
}

impl StoreConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            operation_timeout: Self::DEFAULT_OPERATION_TIMEOUT,
            max_outbox_retries: DEFAULT_MAX_OUTBOX_RETRIES,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup(DATABASE_URL)
            .or_else(|| lookup(FALLBACK_DATABASE_URL))
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing(DATABASE_URL))?;

        Ok(Self {
            database_url,
            max_connections: parse_or(&lookup, MAX_CONNECTIONS, Self::DEFAULT_MAX_CONNECTIONS)?,
            operation_timeout: Duration::from_millis(parse_or(
                &lookup,
                OPERATION_TIMEOUT_MS,
                Self::DEFAULT_OPERATION_TIMEOUT.as_millis() as u64,
            )?),
            max_outbox_retries: parse_or(&lookup, MAX_OUTBOX_RETRIES, DEFAULT_MAX_OUTBOX_RETRIES)?,
        })
    }
}

/// Outbox relay settings.
///
/// The dead-letter threshold belongs to the dispatcher
/// ([`StoreConfig::max_outbox_retries`]), not to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    pub poll_limit: usize,
    pub poll_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_limit: 100,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl OutboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let poll_limit = parse_or(&lookup, OUTBOX_POLL_LIMIT, defaults.poll_limit)?;
        if poll_limit == 0 {
            return Err(ConfigError::Invalid {
                key: OUTBOX_POLL_LIMIT,
                value: "0".to_string(),
            });
        }

        Ok(Self {
            poll_limit,
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                OUTBOX_POLL_INTERVAL_MS,
                defaults.poll_interval.as_millis() as u64,
            )?),
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn store_config_uses_defaults() {
        let config = StoreConfig::from_lookup(lookup(&[(DATABASE_URL, "postgres://localhost/pay")])).unwrap();
        assert_eq!(config, StoreConfig::new("postgres://localhost/pay"));
    }

    #[test]
    fn store_config_falls_back_to_database_url() {
        let config = StoreConfig::from_lookup(lookup(&[
            (FALLBACK_DATABASE_URL, "postgres://fallback/pay"),
            (MAX_OUTBOX_RETRIES, "3"),
            (OPERATION_TIMEOUT_MS, "250"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "postgres://fallback/pay");
        assert_eq!(config.max_outbox_retries, 3);
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
    }

    #[test]
    fn missing_url_is_an_error() {
        assert_eq!(
            StoreConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing(DATABASE_URL))
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = OutboxConfig::from_lookup(lookup(&[(OUTBOX_POLL_LIMIT, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: OUTBOX_POLL_LIMIT,
                value: "lots".to_string()
            }
        );
        assert!(OutboxConfig::from_lookup(lookup(&[(OUTBOX_POLL_LIMIT, "0")])).is_err());
    }
}
