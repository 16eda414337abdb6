//! Logging subsystem for walletlink
//!
//! Everything in the engine logs through `tracing` with structured fields
//! (`topic`, `id`, `method`). This module installs the global subscriber.
//! Library users who already run their own subscriber simply never call
//! [`init_logging`].

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// Noisy dependencies held at `warn` unless RUST_LOG says otherwise.
const QUIET_TARGETS: &[&str] = &["tungstenite", "tokio_tungstenite", "rustls"];

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub with_timestamp: bool,
    pub with_target: bool,
    pub json_format: bool,
    /// Extra `EnvFilter` directives such as `walletlink_core::core_relay=trace`
    pub directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_timestamp: true,
            with_target: true,
            json_format: false,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.with_timestamp = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Build the filter: RUST_LOG wins, otherwise level + quiet targets + directives.
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        let mut filter = EnvFilter::new(self.level.as_str());
        let quiet = QUIET_TARGETS.iter().map(|t| format!("{}=warn", t));
        for directive in quiet.chain(self.directives.iter().cloned()) {
            let parsed = directive
                .parse()
                .map_err(|e| LoggingError::InvalidConfiguration(format!("{}: {}", directive, e)))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

impl From<&crate::config::LoggingConfig> for LogConfig {
    fn from(cfg: &crate::config::LoggingConfig) -> Self {
        Self {
            level: cfg.level,
            with_timestamp: true,
            with_target: cfg.with_target,
            json_format: cfg.json,
            directives: cfg.directives.clone(),
        }
    }
}

/// Initialize logging with the default configuration
///
/// # Example
/// ```
/// use walletlink_core::logging::init_logging;
///
/// let _ = init_logging();
/// ```
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Initialize logging with a custom configuration
///
/// Fails with [`LoggingError::InitializationFailed`] when a global
/// subscriber is already installed.
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match (config.json_format, config.with_timestamp) {
        (true, _) => registry
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init(),
        (false, true) => registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init(),
        (false, false) => registry
            .with(fmt::layer().without_time().with_target(config.with_target))
            .try_init(),
    };

    result.map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new(LogLevel::Debug)
            .with_timestamp(false)
            .json_format(true)
            .directive("walletlink_core::core_relay=trace");

        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.with_timestamp);
        assert!(config.with_target);
        assert!(config.json_format);
        assert_eq!(config.directives.len(), 1);
    }

    #[test]
    fn test_invalid_directive_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LogConfig::default().directive("walletlink_core=notalevel");
        assert!(matches!(
            config.env_filter(),
            Err(LoggingError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_from_logging_section() {
        let section = crate::config::LoggingConfig {
            level: LogLevel::Warn,
            json: true,
            with_target: false,
            directives: vec!["walletlink_core=debug".into()],
        };
        let config = LogConfig::from(&section);
        assert_eq!(config.level, LogLevel::Warn);
        assert!(config.json_format);
        assert!(!config.with_target);
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging_with_config(LogConfig::new(LogLevel::Error));
        assert!(init_logging().is_err());
    }
}
