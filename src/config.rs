//! Session configuration
//!
//! Everything has a default, so an empty TOML document is a valid
//! configuration. Durations are written as integer milliseconds.
//!
//! ```toml
//! connect_timeout_ms = 5000
//!
//! [reconnect]
//! initial_delay_ms = 2000
//! max_delay_ms = 30000
//!
//! [[servers]]
//! name = "Living room"
//! host = "192.168.1.20"
//! auto_connect = true
//! ```

use crate::error::{Result, SnapError};
use crate::types::DEFAULT_CONTROL_PORT;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::RangeInclusive;
use std::time::Duration;

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Backoff between reconnection attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First delay after a failed attempt
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// Ceiling the doubling delay never exceeds
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// A saved server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect to this server on startup
    #[serde(default)]
    pub auto_connect: bool,
}

fn default_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

/// Settings for one control session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Deadline for each RPC call
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Lowest latency offset accepted locally, in milliseconds
    pub min_latency_ms: i32,
    /// Highest latency offset accepted locally, in milliseconds
    pub max_latency_ms: i32,
    pub servers: Vec<ServerProfile>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            min_latency_ms: -1000,
            max_latency_ms: 1000,
            servers: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(source).map_err(|e| SnapError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(SnapError::Config("Timeouts must be greater than zero".to_string()));
        }
        if self.reconnect.initial_delay.is_zero() {
            return Err(SnapError::Config("Reconnect delay must be greater than zero".to_string()));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(SnapError::Config(
                "Maximum reconnect delay is below the initial delay".to_string(),
            ));
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(SnapError::Config(format!(
                "Empty latency range {}..={}",
                self.min_latency_ms, self.max_latency_ms
            )));
        }
        for profile in &self.servers {
            if profile.host.trim().is_empty() {
                return Err(SnapError::Config(format!("Server '{}' has no host", profile.name)));
            }
        }
        Ok(())
    }

    /// Latency offsets accepted without a round trip
    pub fn latency_range(&self) -> RangeInclusive<i32> {
        self.min_latency_ms..=self.max_latency_ms
    }

    /// First profile marked for automatic connection
    pub fn auto_connect_server(&self) -> Option<&ServerProfile> {
        self.servers.iter().find(|profile| profile.auto_connect)
    }
}
