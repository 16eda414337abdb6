//! Configuration management for walletlink
//!
//! Three sections: relay connection, engine tuning, logging. Every value has a
//! default; the environment (`WALLETLINK_<SECTION>_<KEY>`) or a TOML file can
//! override them.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::logging::LogLevel;

mod error;

pub use error::ConfigError;

pub const DEFAULT_RELAY_URL: &str = "wss://relay.walletconnect.org";
pub const DEFAULT_RELAY_PROTOCOL: &str = "irn";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// Relay connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base websocket URL; auth and project id are appended as query params
    pub url: String,

    pub project_id: String,

    /// Relay protocol prefix for RPC methods (`irn` -> `irn_publish`)
    pub protocol: String,

    pub user_agent: String,

    /// How long a single publish/subscribe waits for the relay's ack
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Upper bound for a publish including redelivery
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Random extra delay added to each reconnect attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_jitter: Duration,

    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Inbound silence after which the socket is considered dead
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
}

/// Protocol engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of every key written to storage
    pub storage_prefix: String,

    /// Resolved JSON-RPC records older than this are pruned
    #[serde(with = "humantime_serde")]
    pub history_retention: Duration,

    /// Capacity of each broadcast event bus
    pub event_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub json: bool,
    pub with_target: bool,
    pub directives: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            project_id: String::new(),
            protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            user_agent: format!("wc-2/rust-walletlink-{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(1),
            reconnect_jitter: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(40),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_prefix: "walletlink@2".to_string(),
            history_retention: Duration::from_secs(30 * 24 * 60 * 60),
            event_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            with_target: true,
            directives: Vec::new(),
        }
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

fn env_duration(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Variables follow `WALLETLINK_<SECTION>_<KEY>`, e.g.
    /// `WALLETLINK_RELAY_PROJECT_ID=abc` or `WALLETLINK_RELAY_HEARTBEAT_INTERVAL=15s`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = env_parse("WALLETLINK_RELAY_URL")? {
            config.relay.url = url;
        }
        if let Some(project_id) = env_parse("WALLETLINK_RELAY_PROJECT_ID")? {
            config.relay.project_id = project_id;
        }
        if let Some(protocol) = env_parse("WALLETLINK_RELAY_PROTOCOL")? {
            config.relay.protocol = protocol;
        }
        if let Some(d) = env_duration("WALLETLINK_RELAY_REQUEST_TIMEOUT")? {
            config.relay.request_timeout = d;
        }
        if let Some(d) = env_duration("WALLETLINK_RELAY_PUBLISH_TIMEOUT")? {
            config.relay.publish_timeout = d;
        }
        if let Some(d) = env_duration("WALLETLINK_RELAY_RECONNECT_INTERVAL")? {
            config.relay.reconnect_interval = d;
        }
        if let Some(d) = env_duration("WALLETLINK_RELAY_HEARTBEAT_INTERVAL")? {
            config.relay.heartbeat_interval = d;
        }
        if let Some(d) = env_duration("WALLETLINK_RELAY_HEARTBEAT_TIMEOUT")? {
            config.relay.heartbeat_timeout = d;
        }

        if let Some(prefix) = env_parse("WALLETLINK_ENGINE_STORAGE_PREFIX")? {
            config.engine.storage_prefix = prefix;
        }
        if let Some(d) = env_duration("WALLETLINK_ENGINE_HISTORY_RETENTION")? {
            config.engine.history_retention = d;
        }

        if let Some(level) = env::var("WALLETLINK_LOG_LEVEL").ok() {
            config.logging.level = level.parse().map_err(|e: crate::logging::LoggingError| {
                ConfigError::InvalidValue {
                    key: "WALLETLINK_LOG_LEVEL".to_string(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(json) = env_parse("WALLETLINK_LOG_JSON")? {
            config.logging.json = json;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.relay.url).map_err(|e| ConfigError::InvalidRelayUrl {
            url: self.relay.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidRelayUrl {
                url: self.relay.url.clone(),
                reason: format!("scheme must be ws or wss, got {}", url.scheme()),
            });
        }

        if self.relay.protocol.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "relay protocol must not be empty".to_string(),
            ));
        }

        if self.relay.request_timeout.is_zero() || self.relay.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "relay timeouts must be greater than 0".to_string(),
            ));
        }

        if self.relay.publish_timeout < self.relay.request_timeout {
            return Err(ConfigError::ValidationFailed(
                "publish_timeout must be at least request_timeout".to_string(),
            ));
        }

        if self.relay.heartbeat_timeout <= self.relay.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_timeout must exceed heartbeat_interval".to_string(),
            ));
        }

        if self.engine.event_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.protocol, "irn");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.relay.url = "https://relay.example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRelayUrl { .. })
        ));

        config = Config::default();
        config.relay.heartbeat_timeout = config.relay.heartbeat_interval;
        assert!(config.validate().is_err());

        config = Config::default();
        config.relay.publish_timeout = Duration::from_millis(1);
        assert!(config.validate().is_err());

        config = Config::default();
        config.engine.event_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walletlink.toml");

        let mut config = Config::default();
        config.relay.project_id = "abc123".to_string();
        config.relay.heartbeat_interval = Duration::from_secs(5);
        config.logging.level = LogLevel::Debug;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[relay]\nproject_id = \"p1\"\nheartbeat_interval = \"10s\"\n")
            .unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.relay.project_id, "p1");
        assert_eq!(loaded.relay.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(loaded.relay.url, DEFAULT_RELAY_URL);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/walletlink.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
