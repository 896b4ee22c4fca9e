//! Configuration loading and management.
//!
//! The daemon is configured entirely through environment variables, the
//! way its deployment tooling passes settings to every service in the
//! homeserver fleet.

use std::net::SocketAddr;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Persistent store DSN (a SQLite path, or `:memory:`).
    pub database: String,
    /// Broker URIs for the ingress/egress logs (`mem://` or `file:///path`).
    pub broker_uris: Vec<String>,
    /// Topic carrying input room events.
    pub input_topic: String,
    /// Topic receiving output room events.
    pub output_topic: String,
    /// Address the query/metrics HTTP listener binds to.
    pub bind_address: SocketAddr,
    /// Shut down after processing this many inputs (benchmark runs).
    pub stop_after: Option<u64>,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database: require("DATABASE")?,
            broker_uris: require("KAFKA_URIS")?
                .split(',')
                .map(|uri| uri.trim().to_string())
                .filter(|uri| !uri.is_empty())
                .collect(),
            input_topic: require("TOPIC_INPUT_ROOM_EVENT")?,
            output_topic: require("TOPIC_OUTPUT_ROOM_EVENT")?,
            bind_address: parse("BIND_ADDRESS", &require("BIND_ADDRESS")?)?,
            stop_after: match std::env::var("STOP_AFTER") {
                Ok(value) if !value.is_empty() => Some(parse("STOP_AFTER", &value)?),
                _ => None,
            },
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
