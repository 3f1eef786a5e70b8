//! Client configuration types

use crate::endpoint::{RelayEndpoint, parse_endpoints};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Capped exponential backoff for automatic reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// Relay client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Relay URLs to connect to on startup
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,

    /// Timeout for establishing a connection in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Keep-alive ping interval in milliseconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// A connection with no inbound traffic for this long is failed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Reconnect supervisor scan interval in milliseconds
    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval_ms: u64,

    #[serde(default)]
    pub reconnect_backoff: BackoffConfig,

    /// Capacity of the event bus broadcast channel
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Number of (subscription, event id) pairs remembered for dedup
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Drop events whose id is not the hash of their content
    #[serde(default = "default_true")]
    pub verify_event_ids: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            connect_timeout_ms: default_connect_timeout(),
            ping_interval_ms: default_ping_interval(),
            idle_timeout_ms: default_idle_timeout(),
            supervisor_interval_ms: default_supervisor_interval(),
            reconnect_backoff: BackoffConfig::default(),
            bus_capacity: default_bus_capacity(),
            dedup_capacity: default_dedup_capacity(),
            verify_event_ids: true,
        }
    }
}

impl ClientConfig {
    pub fn with_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relays = relays.into_iter().map(Into::into).collect();
        self
    }

    /// Configured relays, normalized. Invalid entries are skipped.
    pub fn endpoints(&self) -> Vec<RelayEndpoint> {
        parse_endpoints(&self.relays)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }

    /// Reject values that would stall or spin the client.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_capacity == 0 {
            return Err(ConfigError::Invalid("busCapacity must be > 0".to_string()));
        }
        if self.ping_interval_ms == 0 || self.supervisor_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pingIntervalMs and supervisorIntervalMs must be > 0".to_string(),
            ));
        }
        if self.idle_timeout_ms <= self.ping_interval_ms {
            return Err(ConfigError::Invalid(
                "idleTimeoutMs must exceed pingIntervalMs".to_string(),
            ));
        }
        if self.reconnect_backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnectBackoff.multiplier must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relays used when none are configured.
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol", "wss://relay.primal.net"];

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_ping_interval() -> u64 {
    30_000
}

fn default_idle_timeout() -> u64 {
    90_000
}

fn default_supervisor_interval() -> u64 {
    10_000
}

fn default_backoff_initial() -> u64 {
    1_000
}

fn default_backoff_max() -> u64 {
    300_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_bus_capacity() -> usize {
    4096
}

fn default_dedup_capacity() -> usize {
    50_000
}

fn default_true() -> bool {
    true
}
